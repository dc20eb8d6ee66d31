//! Error taxonomy shared by the store, remote and sync layers.

use thiserror::Error;

/// Failures of the local persistent store.
///
/// None of these are fatal to the write path: callers log them and keep the
/// affected value in memory for the rest of the session.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("storage quota exceeded ({needed} bytes needed, {available} available)")]
  QuotaExceeded { needed: usize, available: usize },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("corrupted entry at {key}: {reason}")]
  Corrupted { key: String, reason: String },

  #[error("storage backend error: {0}")]
  Backend(String),
}

impl From<rusqlite::Error> for StorageError {
  fn from(e: rusqlite::Error) -> Self {
    StorageError::Backend(e.to_string())
  }
}

/// Failures talking to the remote record store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
  #[error("request timed out after {0:?}")]
  Timeout(std::time::Duration),

  #[error("network error: {0}")]
  Network(String),

  /// The remote store understood the request and refused it on validation
  /// or business-rule grounds. Retrying the same payload will not help.
  #[error("rejected by remote store (HTTP {status}): {message}")]
  Rejected { status: u16, message: String },

  /// Credentials expired or were refused. Says nothing about the payload.
  #[error("not authorized by remote store (HTTP {status}): {message}")]
  Unauthorized { status: u16, message: String },

  #[error("unexpected response from remote store: {0}")]
  Schema(String),
}

impl RemoteError {
  /// Whether a later retry of the same payload may succeed.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      RemoteError::Timeout(_) | RemoteError::Network(_) | RemoteError::Unauthorized { .. }
    )
  }

  /// Classify an HTTP status code returned by the remote store.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let message = message.into();
    match status {
      408 | 429 | 500..=599 => RemoteError::Network(format!("HTTP {}: {}", status, message)),
      401 | 403 => RemoteError::Unauthorized { status, message },
      _ => RemoteError::Rejected { status, message },
    }
  }
}

impl From<reqwest::Error> for RemoteError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      RemoteError::Schema(e.to_string())
    } else if let Some(status) = e.status() {
      RemoteError::from_status(status.as_u16(), e.to_string())
    } else {
      RemoteError::Network(e.to_string())
    }
  }
}
