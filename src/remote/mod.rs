//! Remote record store contract.
//!
//! The remote side is a relational REST API keyed by client-assigned UUIDs.
//! Writes are upserts on the `id` column, so replaying the same write is
//! harmless.

mod memory;
mod rest;

pub use memory::{InMemoryRemote, RemoteWrite};
pub use rest::RestRemoteStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RemoteError;

/// Name of the primary key column on every synced table.
pub const KEY_COLUMN: &str = "id";

#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Insert or update rows, matching on [`KEY_COLUMN`].
  async fn upsert(&self, table: &str, rows: &[Value]) -> Result<(), RemoteError>;

  /// Delete the row with the given key. Deleting a missing row succeeds.
  async fn delete(&self, table: &str, key: &str) -> Result<(), RemoteError>;

  /// Rows whose columns equal all the given values.
  async fn select(&self, table: &str, filters: &[(&str, &str)]) -> Result<Vec<Value>, RemoteError>;
}
