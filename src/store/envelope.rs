//! Integrity envelope for persisted cache values.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::StorageError;

/// A persisted value together with the SHA-256 of its canonical JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
  pub sha256: String,
  pub data: Value,
}

fn digest(data: &Value) -> Result<String, StorageError> {
  let bytes = serde_json::to_vec(data)?;
  let mut hasher = Sha256::new();
  hasher.update(&bytes);
  Ok(hex::encode(hasher.finalize()))
}

/// Wrap a value for storage.
pub fn seal<T: Serialize>(value: &T) -> Result<Value, StorageError> {
  let data = serde_json::to_value(value)?;
  let sha256 = digest(&data)?;
  Ok(serde_json::to_value(Envelope { sha256, data })?)
}

/// Unwrap and verify a stored value.
///
/// Returns `StorageError::Corrupted` when the blob is not an envelope, the
/// digest does not match, or the payload does not deserialize into `T`.
pub fn open_envelope<T: DeserializeOwned>(key: &str, raw: Value) -> Result<T, StorageError> {
  let corrupted = |reason: String| StorageError::Corrupted {
    key: key.to_string(),
    reason,
  };

  let envelope: Envelope =
    serde_json::from_value(raw).map_err(|e| corrupted(format!("not an envelope: {}", e)))?;

  let actual = digest(&envelope.data)?;
  if actual != envelope.sha256 {
    return Err(corrupted("checksum mismatch".to_string()));
  }

  serde_json::from_value(envelope.data).map_err(|e| corrupted(format!("bad payload: {}", e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_tampered_payload_is_rejected() {
    let mut sealed = seal(&json!({"status": "planned"})).unwrap();
    sealed["data"]["status"] = json!("productive");

    let result: Result<Value, _> = open_envelope("status:x", sealed);
    assert!(matches!(result, Err(StorageError::Corrupted { .. })));
  }

  #[test]
  fn test_non_envelope_is_rejected() {
    let result: Result<Value, _> = open_envelope("status:x", json!("garbage"));
    assert!(matches!(result, Err(StorageError::Corrupted { .. })));
  }

  #[test]
  fn test_sealed_value_opens() {
    let sealed = seal(&vec![1, 2, 3]).unwrap();
    let opened: Vec<i32> = open_envelope("k", sealed).unwrap();
    assert_eq!(opened, vec![1, 2, 3]);
  }
}
