//! Local persistent key-value storage.
//!
//! This module provides the durable storage every other component sits on:
//! - A small async `KeyValueStore` contract (get / set / remove / get_all by prefix)
//! - A SQLite backend for installed builds and an in-memory backend for tests
//! - A checksummed envelope so tampered or half-written values read as misses

mod envelope;
mod memory;
mod sqlite;

pub use envelope::{open_envelope, seal, Envelope};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;

/// Trait for local storage backends.
///
/// All operations are local-only. Implementations may block internally but
/// must not touch the network.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
  /// Get the value stored at `key`.
  async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

  /// Store `value` at `key`, replacing any previous value.
  async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError>;

  /// Remove `key`. Removing a missing key is not an error.
  async fn remove(&self, key: &str) -> Result<(), StorageError>;

  /// All entries whose key starts with `prefix`, ordered by key.
  async fn get_all(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError>;
}

/// Whether a local write reached durable storage.
///
/// `MemoryOnly` means persistence failed (quota, backend error) and the value
/// lives only for the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
  Durable,
  MemoryOnly,
}

/// Key prefixes used by the components sharing one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
  Status,
  Queue,
  Applied,
  Entity,
  Settings,
}

impl Namespace {
  pub fn prefix(self) -> &'static str {
    match self {
      Namespace::Status => "status:",
      Namespace::Queue => "queue:",
      Namespace::Applied => "applied:",
      Namespace::Entity => "entity:",
      Namespace::Settings => "settings:",
    }
  }

  /// Build a full key from this namespace and a local key.
  pub fn key(self, local: &str) -> String {
    format!("{}{}", self.prefix(), local)
  }

  /// Strip this namespace from a full key.
  pub fn local<'a>(self, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(self.prefix())
  }
}
