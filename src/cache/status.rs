//! Per-day status cache for visits and similar tracked entities.
//!
//! Entries live in memory for the session and are mirrored to the local store
//! in the background by a single writer task, so disk writes land in the order
//! the cache changed. A status in a terminal state is final: it is never
//! re-read from the network until something invalidates it.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::StorageError;
use crate::store::{open_envelope, seal, KeyValueStore, Namespace};

/// How long a cached status is kept regardless of finality.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// Lifecycle of a tracked entity within one business day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
  Planned,
  InProgress,
  /// Visit completed with an order.
  Productive,
  /// Visit completed without an order.
  Unproductive,
  Cancelled,
}

impl VisitStatus {
  pub fn is_final(self) -> bool {
    matches!(self, VisitStatus::Productive | VisitStatus::Unproductive)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      VisitStatus::Planned => "planned",
      VisitStatus::InProgress => "in_progress",
      VisitStatus::Productive => "productive",
      VisitStatus::Unproductive => "unproductive",
      VisitStatus::Cancelled => "cancelled",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    serde_json::from_value(Value::String(s.to_string())).ok()
  }
}

/// Composite key: one status per entity, user and business day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusKey {
  pub entity_id: String,
  pub user_id: String,
  pub business_date: NaiveDate,
}

impl StatusKey {
  pub fn new(entity_id: impl Into<String>, user_id: impl Into<String>, date: NaiveDate) -> Self {
    Self {
      entity_id: entity_id.into(),
      user_id: user_id.into(),
      business_date: date,
    }
  }

  fn storage_key(&self) -> String {
    Namespace::Status.key(&format!(
      "{}:{}:{}",
      self.business_date, self.user_id, self.entity_id
    ))
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedStatusEntry {
  pub key: StatusKey,
  pub status: VisitStatus,
  /// Denormalized values needed for display, e.g. `order_value`.
  pub derived_fields: Map<String, Value>,
  pub is_final: bool,
  pub updated_at: DateTime<Utc>,
}

/// Disk write queued for the writer task.
enum Write {
  Put { key: String, value: Value },
  Remove(Vec<String>),
  Flush(oneshot::Sender<()>),
}

pub struct StatusCache {
  entries: Mutex<HashMap<StatusKey, CachedStatusEntry>>,
  clock: Arc<dyn Clock>,
  retention: Duration,
  writes: mpsc::UnboundedSender<Write>,
  errors: Arc<Mutex<Vec<String>>>,
}

impl StatusCache {
  /// Load persisted entries, dropping expired and corrupted ones.
  pub async fn load(
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
  ) -> Self {
    let mut entries = HashMap::new();
    let cutoff = clock.now() - retention;

    let stored = match store.get_all(Namespace::Status.prefix()).await {
      Ok(stored) => stored,
      Err(e) => {
        warn!(error = %e, "status cache could not be loaded, starting empty");
        Vec::new()
      }
    };

    let mut discard = Vec::new();
    for (key, raw) in stored {
      match open_envelope::<CachedStatusEntry>(&key, raw) {
        Ok(entry) if entry.updated_at < cutoff => {
          debug!(key = %key, "dropping expired status entry");
          discard.push(key);
        }
        Ok(entry) => {
          entries.insert(entry.key.clone(), entry);
        }
        Err(e) => {
          warn!(error = %e, "discarding corrupted status entry");
          discard.push(key);
        }
      }
    }

    for key in discard {
      if let Err(e) = store.remove(&key).await {
        warn!(key = %key, error = %e, "failed to remove discarded status entry");
      }
    }

    let errors = Arc::new(Mutex::new(Vec::new()));
    let (writes, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_writer(store, rx, Arc::clone(&errors)));

    Self {
      entries: Mutex::new(entries),
      clock,
      retention,
      writes,
      errors,
    }
  }

  pub fn retention(&self) -> Duration {
    self.retention
  }

  /// Current entry for the key. Never touches the network.
  pub fn get(&self, key: &StatusKey) -> Option<CachedStatusEntry> {
    self.lock_entries().get(key).cloned()
  }

  /// Record a status observation.
  ///
  /// Returns the entry now held by the cache. A final entry is kept as is;
  /// call [`StatusCache::invalidate`] first to override it.
  pub fn set(
    &self,
    key: StatusKey,
    status: VisitStatus,
    derived_fields: Map<String, Value>,
  ) -> CachedStatusEntry {
    let mut entries = self.lock_entries();
    if let Some(existing) = entries.get(&key) {
      if existing.is_final {
        debug!(entity = %key.entity_id, "ignoring update to final status");
        return existing.clone();
      }
    }

    let entry = CachedStatusEntry {
      key: key.clone(),
      status,
      derived_fields,
      is_final: status.is_final(),
      updated_at: self.clock.now(),
    };
    entries.insert(key, entry.clone());

    // Queued under the entries lock so disk order matches memory order
    match seal(&entry) {
      Ok(value) => self.send(Write::Put {
        key: entry.key.storage_key(),
        value,
      }),
      Err(e) => self.record_error(e.to_string()),
    }
    entry
  }

  /// False only when a final entry exists for the key.
  pub fn should_refresh_from_network(&self, key: &StatusKey) -> bool {
    !self
      .lock_entries()
      .get(key)
      .map(|entry| entry.is_final)
      .unwrap_or(false)
  }

  /// Force-evict one entry, e.g. after an admin correction.
  pub fn invalidate(&self, key: &StatusKey) {
    let mut entries = self.lock_entries();
    entries.remove(key);
    self.send(Write::Remove(vec![key.storage_key()]));
  }

  /// Evict everything; statuses are scoped to a business day.
  pub fn clear_all_for_date_change(&self) {
    let mut entries = self.lock_entries();
    let evicted: Vec<String> = entries.drain().map(|(key, _)| key.storage_key()).collect();
    self.send(Write::Remove(evicted));
  }

  pub fn len(&self) -> usize {
    self.lock_entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock_entries().is_empty()
  }

  /// Wait until every disk write queued so far has landed.
  pub async fn flush(&self) {
    let (done, landed) = oneshot::channel();
    self.send(Write::Flush(done));
    if landed.await.is_err() {
      self.record_error("status cache writer stopped".to_string());
    }
  }

  /// Failures from background persistence, oldest first.
  pub fn persistence_errors(&self) -> Vec<String> {
    self.errors.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  fn send(&self, write: Write) {
    if self.writes.send(write).is_err() {
      self.record_error("status cache writer stopped".to_string());
    }
  }

  fn record_error(&self, message: String) {
    record_error(&self.errors, message);
  }

  fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<StatusKey, CachedStatusEntry>> {
    self.entries.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Apply queued writes one at a time, in the order they were queued.
async fn run_writer(
  store: Arc<dyn KeyValueStore>,
  mut rx: mpsc::UnboundedReceiver<Write>,
  errors: Arc<Mutex<Vec<String>>>,
) {
  while let Some(write) = rx.recv().await {
    let result = match write {
      Write::Put { key, value } => store.set(&key, &value).await,
      Write::Remove(keys) => remove_all(store.as_ref(), &keys).await,
      Write::Flush(done) => {
        let _ = done.send(());
        Ok(())
      }
    };
    if let Err(e) = result {
      warn!(error = %e, "status cache persistence failed");
      record_error(&errors, e.to_string());
    }
  }
}

async fn remove_all(store: &dyn KeyValueStore, keys: &[String]) -> Result<(), StorageError> {
  for key in keys {
    store.remove(key).await?;
  }
  Ok(())
}

fn record_error(errors: &Mutex<Vec<String>>, message: String) {
  errors
    .lock()
    .unwrap_or_else(|e| e.into_inner())
    .push(message);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::store::MemoryStore;
  use chrono::TimeZone;
  use serde_json::json;

  fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()
  }

  fn key(date: NaiveDate) -> StatusKey {
    StatusKey::new("visit-1", "user-1", date)
  }

  async fn cache_with(
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
  ) -> StatusCache {
    StatusCache::load(store, clock, Duration::days(DEFAULT_RETENTION_DAYS)).await
  }

  #[tokio::test]
  async fn test_final_status_suppresses_network_reads() {
    let clock = Arc::new(ManualClock::new(start()));
    let cache = cache_with(Arc::new(MemoryStore::new()), clock.clone()).await;
    let k = key(clock.today());

    assert!(cache.should_refresh_from_network(&k));

    cache.set(k.clone(), VisitStatus::InProgress, Map::new());
    assert!(cache.should_refresh_from_network(&k));

    let entry = cache.set(k.clone(), VisitStatus::Productive, Map::new());
    assert!(entry.is_final);
    assert!(!cache.should_refresh_from_network(&k));

    // Age does not matter once final
    clock.advance(Duration::days(30));
    assert!(!cache.should_refresh_from_network(&k));

    cache.invalidate(&k);
    assert!(cache.should_refresh_from_network(&k));
  }

  #[tokio::test]
  async fn test_final_entry_is_immutable_until_invalidated() {
    let clock = Arc::new(ManualClock::new(start()));
    let cache = cache_with(Arc::new(MemoryStore::new()), clock.clone()).await;
    let k = key(clock.today());

    let mut fields = Map::new();
    fields.insert("order_value".to_string(), json!(1250.0));
    cache.set(k.clone(), VisitStatus::Productive, fields);

    let kept = cache.set(k.clone(), VisitStatus::Planned, Map::new());
    assert_eq!(kept.status, VisitStatus::Productive);
    assert_eq!(kept.derived_fields["order_value"], json!(1250.0));

    cache.invalidate(&k);
    let replaced = cache.set(k.clone(), VisitStatus::Unproductive, Map::new());
    assert_eq!(replaced.status, VisitStatus::Unproductive);
  }

  #[tokio::test]
  async fn test_entries_survive_reload_and_expire_lazily() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(start()));
    let today = clock.today();

    let cache = cache_with(store.clone(), clock.clone()).await;
    cache.set(key(today), VisitStatus::Productive, Map::new());
    cache.flush().await;

    let reloaded = cache_with(store.clone(), clock.clone()).await;
    assert_eq!(
      reloaded.get(&key(today)).map(|e| e.status),
      Some(VisitStatus::Productive)
    );

    clock.advance(Duration::days(DEFAULT_RETENTION_DAYS) + Duration::minutes(1));
    let expired = cache_with(store.clone(), clock.clone()).await;
    assert!(expired.get(&key(today)).is_none());
    assert!(store.get_all("status:").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_corrupted_entry_is_a_miss() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(start()));
    let k = key(clock.today());

    let cache = cache_with(store.clone(), clock.clone()).await;
    cache.set(k.clone(), VisitStatus::Productive, Map::new());
    cache.flush().await;

    let storage_key = k.storage_key();
    let mut raw = store.get(&storage_key).await.unwrap().unwrap();
    raw["data"]["status"] = json!("unproductive");
    store.insert_raw(&storage_key, raw);

    let reloaded = cache_with(store.clone(), clock).await;
    assert!(reloaded.get(&k).is_none());
    assert!(reloaded.should_refresh_from_network(&k));
    assert_eq!(store.get(&storage_key).await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_persistence_failure_is_recorded_not_raised() {
    let store = Arc::new(MemoryStore::new());
    store.set_fail_writes(true);
    let clock = Arc::new(ManualClock::new(start()));
    let k = key(clock.today());

    let cache = cache_with(store, clock).await;
    cache.set(k.clone(), VisitStatus::InProgress, Map::new());
    cache.flush().await;

    assert_eq!(cache.get(&k).map(|e| e.status), Some(VisitStatus::InProgress));
    assert_eq!(cache.persistence_errors().len(), 1);
  }

  #[tokio::test]
  async fn test_date_change_clears_memory_and_disk() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(start()));
    let yesterday = clock.today();

    let cache = cache_with(store.clone(), clock.clone()).await;
    cache.set(key(yesterday), VisitStatus::Productive, Map::new());
    cache.flush().await;

    clock.advance(Duration::days(1));
    cache.clear_all_for_date_change();
    cache.flush().await;

    assert!(cache.is_empty());
    assert!(cache.should_refresh_from_network(&key(clock.today())));
    assert!(store.get_all("status:").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_invalidate_is_not_undone_by_a_slow_earlier_write() {
    let store = Arc::new(MemoryStore::new());
    store.set_write_delay(std::time::Duration::from_millis(50));
    let clock = Arc::new(ManualClock::new(start()));
    let k = key(clock.today());

    let cache = cache_with(store.clone(), clock.clone()).await;
    cache.set(k.clone(), VisitStatus::Productive, Map::new());
    cache.invalidate(&k);
    assert!(cache.should_refresh_from_network(&k));
    cache.flush().await;

    let reloaded = cache_with(store.clone(), clock).await;
    assert!(reloaded.get(&k).is_none());
    assert!(reloaded.should_refresh_from_network(&k));
  }

  #[tokio::test]
  async fn test_date_change_wins_over_pending_writes() {
    let store = Arc::new(MemoryStore::new());
    store.set_write_delay(std::time::Duration::from_millis(20));
    let clock = Arc::new(ManualClock::new(start()));

    let cache = cache_with(store.clone(), clock.clone()).await;
    cache.set(key(clock.today()), VisitStatus::Unproductive, Map::new());
    cache.set(
      StatusKey::new("visit-2", "user-1", clock.today()),
      VisitStatus::InProgress,
      Map::new(),
    );
    cache.clear_all_for_date_change();
    cache.flush().await;

    assert!(store.get_all("status:").await.unwrap().is_empty());
    assert!(cache.persistence_errors().is_empty());
  }

  #[test]
  fn test_status_parse() {
    assert_eq!(VisitStatus::parse("in_progress"), Some(VisitStatus::InProgress));
    assert_eq!(VisitStatus::parse("bogus"), None);
    assert_eq!(VisitStatus::Productive.as_str(), "productive");
  }
}
