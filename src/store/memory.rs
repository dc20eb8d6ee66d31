//! In-memory store with an optional byte quota.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::KeyValueStore;
use crate::error::StorageError;

/// Storage kept entirely in process memory.
///
/// Used in tests and as a fallback when no durable storage can be opened.
/// A quota makes it behave like a nearly-full device.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, Value>>,
  quota_bytes: Option<usize>,
  fail_writes: AtomicBool,
  write_delay_ms: AtomicU64,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Limit the total size of keys plus serialized values.
  pub fn with_quota(quota_bytes: usize) -> Self {
    Self {
      quota_bytes: Some(quota_bytes),
      ..Self::default()
    }
  }

  /// Make every subsequent `set` fail with a backend error.
  pub fn set_fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  /// Make every subsequent `set` sleep before it lands, like a slow disk.
  pub fn set_write_delay(&self, delay: Duration) {
    self.write_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
  }

  /// Overwrite a raw value, bypassing quota and failure injection.
  pub fn insert_raw(&self, key: &str, value: Value) {
    self.lock().insert(key.to_string(), value);
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn entry_size(key: &str, value: &Value) -> usize {
  key.len() + value.to_string().len()
}

#[async_trait]
impl KeyValueStore for MemoryStore {
  async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
    Ok(self.lock().get(key).cloned())
  }

  async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
    let delay = self.write_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
      tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(StorageError::Backend("writes disabled".to_string()));
    }

    let mut entries = self.lock();

    if let Some(quota) = self.quota_bytes {
      let used: usize = entries
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| entry_size(k, v))
        .sum();
      let needed = entry_size(key, value);
      if used + needed > quota {
        return Err(StorageError::QuotaExceeded {
          needed,
          available: quota.saturating_sub(used),
        });
      }
    }

    entries.insert(key.to_string(), value.clone());
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<(), StorageError> {
    self.lock().remove(key);
    Ok(())
  }

  async fn get_all(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
    Ok(
      self
        .lock()
        .range(prefix.to_string()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }
}
