//! In-process remote store with scripted failures and delays.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::{RemoteStore, KEY_COLUMN};
use crate::error::RemoteError;

/// A write as it reached the store.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteWrite {
  Upsert { table: String, key: String },
  Delete { table: String, key: String },
}

#[derive(Default)]
struct State {
  tables: HashMap<String, BTreeMap<String, Value>>,
  writes: Vec<RemoteWrite>,
  /// Failures returned by the next writes, in order.
  next_failures: VecDeque<RemoteError>,
  /// Keys that are always rejected until cleared.
  rejected_keys: HashMap<String, RemoteError>,
  /// One-shot delays applied before a write to the key lands.
  delays: HashMap<String, Duration>,
  offline: bool,
}

/// Remote store held in memory, for tests and local demos.
#[derive(Default)]
pub struct InMemoryRemote {
  state: Mutex<State>,
}

impl InMemoryRemote {
  pub fn new() -> Self {
    Self::default()
  }

  /// Fail the next write with `error`.
  pub fn fail_next(&self, error: RemoteError) {
    self.lock().next_failures.push_back(error);
  }

  /// Reject every write to `key` until [`InMemoryRemote::accept_key`] is called.
  pub fn reject_key(&self, key: &str, error: RemoteError) {
    self.lock().rejected_keys.insert(key.to_string(), error);
  }

  pub fn accept_key(&self, key: &str) {
    self.lock().rejected_keys.remove(key);
  }

  /// Delay the next write to `key`.
  pub fn delay_key(&self, key: &str, delay: Duration) {
    self.lock().delays.insert(key.to_string(), delay);
  }

  /// Make every call fail as a network error.
  pub fn set_offline(&self, offline: bool) {
    self.lock().offline = offline;
  }

  pub fn row(&self, table: &str, key: &str) -> Option<Value> {
    self.lock().tables.get(table)?.get(key).cloned()
  }

  pub fn row_count(&self, table: &str) -> usize {
    self.lock().tables.get(table).map(|t| t.len()).unwrap_or(0)
  }

  /// Every write that was applied, in order.
  pub fn writes(&self) -> Vec<RemoteWrite> {
    self.lock().writes.clone()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Apply scripted behaviour for a write to `key`, returning the delay to wait.
  fn admit(&self, key: &str) -> Result<Option<Duration>, RemoteError> {
    let mut state = self.lock();
    if state.offline {
      return Err(RemoteError::Network("remote unreachable".to_string()));
    }
    if let Some(error) = state.next_failures.pop_front() {
      return Err(error);
    }
    if let Some(error) = state.rejected_keys.get(key) {
      return Err(error.clone());
    }
    Ok(state.delays.remove(key))
  }
}

fn row_key(row: &Value) -> Result<String, RemoteError> {
  match row.get(KEY_COLUMN) {
    Some(Value::String(key)) => Ok(key.clone()),
    Some(other) => Ok(other.to_string()),
    None => Err(RemoteError::Rejected {
      status: 400,
      message: format!("row is missing {}", KEY_COLUMN),
    }),
  }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
  async fn upsert(&self, table: &str, rows: &[Value]) -> Result<(), RemoteError> {
    let keys = rows.iter().map(row_key).collect::<Result<Vec<_>, _>>()?;

    let mut delay = None;
    for key in &keys {
      if let Some(d) = self.admit(key)? {
        delay = Some(delay.map_or(d, |current: Duration| current.max(d)));
      }
    }
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    let mut state = self.lock();
    for (row, key) in rows.iter().zip(keys) {
      let table_rows = state.tables.entry(table.to_string()).or_default();
      let merged = match (table_rows.get_mut(&key), row) {
        (Some(Value::Object(existing)), Value::Object(update)) => {
          for (field, value) in update {
            existing.insert(field.clone(), value.clone());
          }
          true
        }
        _ => false,
      };
      if !merged {
        table_rows.insert(key.clone(), row.clone());
      }
      state.writes.push(RemoteWrite::Upsert {
        table: table.to_string(),
        key,
      });
    }
    Ok(())
  }

  async fn delete(&self, table: &str, key: &str) -> Result<(), RemoteError> {
    if let Some(delay) = self.admit(key)? {
      tokio::time::sleep(delay).await;
    }

    let mut state = self.lock();
    if let Some(rows) = state.tables.get_mut(table) {
      rows.remove(key);
    }
    state.writes.push(RemoteWrite::Delete {
      table: table.to_string(),
      key: key.to_string(),
    });
    Ok(())
  }

  async fn select(&self, table: &str, filters: &[(&str, &str)]) -> Result<Vec<Value>, RemoteError> {
    let state = self.lock();
    if state.offline {
      return Err(RemoteError::Network("remote unreachable".to_string()));
    }

    let matches = |row: &Value| {
      filters.iter().all(|(column, expected)| match row.get(*column) {
        Some(Value::String(s)) => s == expected,
        Some(other) => other.to_string() == *expected,
        None => false,
      })
    };

    Ok(
      state
        .tables
        .get(table)
        .map(|rows| rows.values().filter(|r| matches(r)).cloned().collect())
        .unwrap_or_default(),
    )
  }
}
