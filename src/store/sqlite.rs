//! SQLite-backed key-value store.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::KeyValueStore;
use crate::error::StorageError;

/// SQLite-based storage implementation.
#[derive(Clone)]
pub struct SqliteStore {
  conn: Arc<Mutex<Connection>>,
  quota_bytes: Option<usize>,
}

/// Schema for the key-value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
      quota_bytes: None,
    })
  }

  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Limit the total size of stored keys and values.
  pub fn with_quota(mut self, quota_bytes: usize) -> Self {
    self.quota_bytes = Some(quota_bytes);
    self
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("fieldsync").join("store.db"))
  }

  /// Run a closure against the connection on the blocking pool.
  async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
  where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, StorageError> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let conn = conn
        .lock()
        .map_err(|e| StorageError::Backend(format!("Lock poisoned: {}", e)))?;
      f(&conn)
    })
    .await
    .map_err(|e| StorageError::Backend(format!("Storage task failed: {}", e)))?
  }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
  async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        let raw: Option<String> = conn
          .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
            row.get(0)
          })
          .optional()?;

        match raw {
          Some(text) => Ok(Some(serde_json::from_str(&text)?)),
          None => Ok(None),
        }
      })
      .await
  }

  async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
    let key = key.to_string();
    let text = serde_json::to_string(value)?;
    let quota = self.quota_bytes;

    self
      .with_conn(move |conn| {
        if let Some(quota) = quota {
          let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(length(key) + length(value)), 0) FROM kv WHERE key != ?",
            params![key],
            |row| row.get(0),
          )?;
          let used = used.max(0) as usize;
          let needed = key.len() + text.len();
          if used + needed > quota {
            return Err(StorageError::QuotaExceeded {
              needed,
              available: quota.saturating_sub(used),
            });
          }
        }

        conn.execute(
          "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
          params![key, text],
        )?;
        Ok(())
      })
      .await
  }

  async fn remove(&self, key: &str) -> Result<(), StorageError> {
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        conn.execute("DELETE FROM kv WHERE key = ?", params![key])?;
        Ok(())
      })
      .await
  }

  async fn get_all(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
    let prefix = prefix.to_string();
    self
      .with_conn(move |conn| {
        // substr comparison instead of LIKE so '%' and '_' in keys match literally
        let mut stmt = conn.prepare(
          "SELECT key, value FROM kv WHERE substr(key, 1, ?1) = ?2 ORDER BY key",
        )?;

        let rows: Vec<(String, String)> = stmt
          .query_map(params![prefix.chars().count() as i64, prefix], |row| {
            Ok((row.get(0)?, row.get(1)?))
          })?
          .collect::<Result<_, _>>()?;

        // Undecodable rows come back as their raw text so callers can count
        // them; it never opens as an envelope
        let entries = rows
          .into_iter()
          .map(|(key, text)| match serde_json::from_str(&text) {
            Ok(value) => (key, value),
            Err(e) => {
              tracing::warn!(key = %key, error = %e, "stored value is not valid JSON");
              (key, Value::String(text))
            }
          })
          .collect();
        Ok(entries)
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    {
      let store = SqliteStore::open(&path).unwrap();
      store.set("queue:1", &json!({"id": "a"})).await.unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(
      store.get("queue:1").await.unwrap(),
      Some(json!({"id": "a"}))
    );
  }

  #[tokio::test]
  async fn test_prefix_is_literal() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("store.db")).unwrap();
    store.set("status:a", &json!(1)).await.unwrap();
    store.set("statusXa", &json!(2)).await.unwrap();
    store.set("queue:a", &json!(3)).await.unwrap();

    let all = store.get_all("status:").await.unwrap();
    assert_eq!(all, vec![("status:a".to_string(), json!(1))]);
  }

  #[tokio::test]
  async fn test_invalid_json_row_is_returned_raw() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("store.db")).unwrap();
    store
      .conn
      .lock()
      .unwrap()
      .execute(
        "INSERT INTO kv (key, value) VALUES (?1, ?2)",
        params!["queue:00000000000000000004:x", "{truncated"],
      )
      .unwrap();

    let all = store.get_all("queue:").await.unwrap();
    assert_eq!(
      all,
      vec![(
        "queue:00000000000000000004:x".to_string(),
        Value::String("{truncated".to_string())
      )]
    );
  }

  #[tokio::test]
  async fn test_remove_and_quota() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("store.db"))
      .unwrap()
      .with_quota(20);

    store.set("k", &json!("small")).await.unwrap();
    let err = store
      .set("other", &json!("a value that does not fit"))
      .await
      .unwrap_err();
    assert!(matches!(err, StorageError::QuotaExceeded { .. }));

    store.remove("k").await.unwrap();
    assert_eq!(store.get("k").await.unwrap(), None);
  }
}
