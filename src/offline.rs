//! Offline context: the services wired together, plus the two-phase write API.
//!
//! A write commits locally first (optimistic snapshot + queue entry) and
//! reports that straight away. The remote commit happens later, when the
//! sync engine drains; callers poll it with [`OfflineContext::remote_state`].

use chrono::NaiveDate;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheResult, CachedStatusEntry, StatusCache, StatusKey, StatusReader};
use crate::clock::Clock;
use crate::connectivity::{ConnectivityMonitor, ConnectivitySettings};
use crate::error::RemoteError;
use crate::queue::{
  EntityType, NewOperation, OperationKind, OperationStatus, PendingSummary, QueuedOperation,
  SyncQueue,
};
use crate::registry::InvalidationRegistry;
use crate::remote::{RemoteStore, KEY_COLUMN};
use crate::store::{open_envelope, seal, Durability, KeyValueStore, Namespace};
use crate::sync::{self, SyncEngine, SyncSettings};

const BUSINESS_DATE_KEY: &str = "business_date";

#[derive(Debug, Clone, Copy)]
pub struct OfflineSettings {
  pub retention: chrono::Duration,
  pub connectivity: ConnectivitySettings,
  pub sync: SyncSettings,
}

impl Default for OfflineSettings {
  fn default() -> Self {
    Self {
      retention: chrono::Duration::days(crate::cache::DEFAULT_RETENTION_DAYS),
      connectivity: ConnectivitySettings::default(),
      sync: SyncSettings::default(),
    }
  }
}

/// Result of the local phase of a write.
#[derive(Debug, Clone)]
pub struct WriteReceipt {
  pub op: QueuedOperation,
  /// Whether the local commit reached durable storage.
  pub local: Durability,
}

impl WriteReceipt {
  pub fn op_id(&self) -> Uuid {
    self.op.id
  }
}

/// Remote phase of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommit {
  /// Still queued; will be retried.
  Pending,
  /// Rejected by the remote store; waits for the operator.
  NeedsAttention,
  /// Confirmed by the remote store (or cleared by the operator).
  Settled,
}

pub struct OfflineContext {
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  remote: Arc<dyn RemoteStore>,
  queue: Arc<SyncQueue>,
  status_cache: Arc<StatusCache>,
  status_reader: StatusReader,
  registry: Arc<InvalidationRegistry>,
  connectivity: Arc<ConnectivityMonitor>,
  engine: Arc<SyncEngine>,
  /// Snapshots that could not be persisted; `None` is a pending delete.
  volatile_snapshots: Mutex<HashMap<String, Option<Value>>>,
}

impl OfflineContext {
  /// Build every service on top of `store`, restoring persisted state.
  pub async fn open(
    store: Arc<dyn KeyValueStore>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    settings: OfflineSettings,
  ) -> Self {
    let queue = Arc::new(SyncQueue::load(Arc::clone(&store), Arc::clone(&clock)).await);
    let status_cache = Arc::new(
      StatusCache::load(Arc::clone(&store), Arc::clone(&clock), settings.retention).await,
    );
    let connectivity =
      Arc::new(ConnectivityMonitor::load(Arc::clone(&store), settings.connectivity).await);
    let registry = Arc::new(InvalidationRegistry::new());

    let engine = Arc::new(SyncEngine::new(
      Arc::clone(&queue),
      Arc::clone(&remote),
      Arc::clone(&status_cache),
      Arc::clone(&registry),
      Arc::clone(&clock),
      settings.sync,
    ));

    info!(
      queued = queue.len(),
      cached_statuses = status_cache.len(),
      "offline context ready"
    );

    Self {
      store,
      clock,
      remote,
      queue,
      status_reader: StatusReader::new(Arc::clone(&status_cache)),
      status_cache,
      registry,
      connectivity,
      engine,
      volatile_snapshots: Mutex::new(HashMap::new()),
    }
  }

  /// Local phase of a write: snapshot, enqueue, mark dirty.
  ///
  /// Never fails and never waits on the network.
  pub async fn write(
    &self,
    entity_type: EntityType,
    kind: OperationKind,
    target_key: &str,
    payload: Value,
  ) -> WriteReceipt {
    let snapshot = match kind {
      OperationKind::Delete => None,
      OperationKind::Create => Some(payload.clone()),
      OperationKind::Update => Some(merge_fields(
        self.snapshot(entity_type, target_key).await,
        &payload,
      )),
    };
    let snapshot_durability = self
      .put_snapshot(entity_type, target_key, snapshot)
      .await;

    let new = NewOperation {
      entity_type,
      kind,
      target_key: target_key.to_string(),
      payload,
    };
    let op = self.queue.enqueue(new).await;

    if entity_type == EntityType::Visit && kind != OperationKind::Delete {
      if let Some((key, status, derived)) = sync::visit_status(target_key, &op.payload) {
        self.status_cache.set(key, status, derived);
      }
    }
    self.registry.mark_for_refresh(target_key);

    let local = match (snapshot_durability, self.queue.durability(op.id)) {
      (Durability::Durable, Durability::Durable) => Durability::Durable,
      _ => Durability::MemoryOnly,
    };
    debug!(op = %op.id, key = %target_key, ?local, "local write committed");

    WriteReceipt { op, local }
  }

  /// Remote phase of a write made through [`OfflineContext::write`].
  pub fn remote_state(&self, op_id: Uuid) -> RemoteCommit {
    match self.queue.get(op_id) {
      None => RemoteCommit::Settled,
      Some(op) if op.status == OperationStatus::NeedsAttention => RemoteCommit::NeedsAttention,
      Some(_) => RemoteCommit::Pending,
    }
  }

  /// Cache-first read of a visit status.
  ///
  /// Final statuses never touch the network. While offline, or while a local
  /// write to the visit is still queued, the cached entry is served as is.
  pub async fn read_visit_status(
    &self,
    key: &StatusKey,
  ) -> Result<CacheResult<Option<CachedStatusEntry>>, RemoteError> {
    if self.queue.has_unsettled(EntityType::Visit, &key.entity_id) {
      if let Some(entry) = self.status_cache.get(key) {
        debug!(entity = %key.entity_id, "local write pending, serving cached status");
        let cached_at = entry.updated_at;
        return Ok(CacheResult::from_cache(Some(entry), cached_at));
      }
    }

    let remote = Arc::clone(&self.remote);
    let offline = self.is_using_cache();
    let entity_id = key.entity_id.clone();

    self
      .status_reader
      .fetch_status(key, || async move {
        if offline {
          return Err(RemoteError::Network("offline".to_string()));
        }
        let rows = remote
          .select(EntityType::Visit.table(), &[(KEY_COLUMN, entity_id.as_str())])
          .await?;
        Ok(rows.first().and_then(sync::remote_visit_status))
      })
      .await
  }

  /// Optimistic local copy of a record.
  pub async fn snapshot(&self, entity_type: EntityType, target_key: &str) -> Option<Value> {
    let key = snapshot_key(entity_type, target_key);
    let volatile = self.lock_volatile().get(&key).cloned();
    if let Some(snapshot) = volatile {
      return snapshot;
    }

    match self.store.get(&key).await {
      Ok(Some(raw)) => match open_envelope::<Value>(&key, raw) {
        Ok(value) => Some(value),
        Err(e) => {
          warn!(error = %e, "discarding corrupted snapshot");
          if let Err(e) = self.store.remove(&key).await {
            warn!(key = %key, error = %e, "failed to remove corrupted snapshot");
          }
          None
        }
      },
      Ok(None) => None,
      Err(e) => {
        warn!(error = %e, key = %key, "snapshot read failed");
        None
      }
    }
  }

  /// Fresh client-side key for a new record.
  pub fn new_target_key() -> String {
    Uuid::new_v4().to_string()
  }

  /// Reset day-scoped state if the business date moved since the last call.
  ///
  /// Returns true when a rollover happened.
  pub async fn roll_day_if_needed(&self) -> bool {
    let today = self.clock.today();
    let key = Namespace::Settings.key(BUSINESS_DATE_KEY);

    let last_seen = match self.store.get(&key).await {
      Ok(Some(Value::String(s))) => s.parse::<NaiveDate>().ok(),
      Ok(_) => None,
      Err(e) => {
        warn!(error = %e, "could not read last business date");
        None
      }
    };

    if last_seen == Some(today) {
      return false;
    }

    let rolled = last_seen.is_some();
    if rolled {
      info!(from = ?last_seen, to = %today, "business day rolled over");
      self.status_cache.clear_all_for_date_change();
      self.registry.reset_for_date_change();
    }

    if let Err(e) = self.store.set(&key, &Value::String(today.to_string())).await {
      warn!(error = %e, "business date not persisted");
    }
    rolled
  }

  pub fn pending_summary(&self) -> PendingSummary {
    self.queue.pending_summary()
  }

  pub fn is_using_cache(&self) -> bool {
    self.connectivity.is_using_cache()
  }

  /// Wait for background cache persistence to finish.
  pub async fn flush(&self) {
    self.status_cache.flush().await;
  }

  pub fn engine(&self) -> &Arc<SyncEngine> {
    &self.engine
  }

  pub fn queue(&self) -> &Arc<SyncQueue> {
    &self.queue
  }

  pub fn status_cache(&self) -> &Arc<StatusCache> {
    &self.status_cache
  }

  pub fn registry(&self) -> &Arc<InvalidationRegistry> {
    &self.registry
  }

  pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
    &self.connectivity
  }

  pub fn store(&self) -> &Arc<dyn KeyValueStore> {
    &self.store
  }

  async fn put_snapshot(
    &self,
    entity_type: EntityType,
    target_key: &str,
    snapshot: Option<Value>,
  ) -> Durability {
    let key = snapshot_key(entity_type, target_key);
    let result = match &snapshot {
      Some(value) => match seal(value) {
        Ok(sealed) => self.store.set(&key, &sealed).await,
        Err(e) => Err(e),
      },
      None => self.store.remove(&key).await,
    };

    let mut volatile = self.lock_volatile();
    match result {
      Ok(()) => {
        volatile.remove(&key);
        Durability::Durable
      }
      Err(e) => {
        warn!(error = %e, key = %key, "snapshot kept in memory only");
        volatile.insert(key, snapshot);
        Durability::MemoryOnly
      }
    }
  }

  fn lock_volatile(&self) -> std::sync::MutexGuard<'_, HashMap<String, Option<Value>>> {
    self
      .volatile_snapshots
      .lock()
      .unwrap_or_else(|e| e.into_inner())
  }
}

fn snapshot_key(entity_type: EntityType, target_key: &str) -> String {
  Namespace::Entity.key(&format!("{}:{}", entity_type.table(), target_key))
}

/// Apply an update payload on top of the current snapshot, field by field.
fn merge_fields(current: Option<Value>, update: &Value) -> Value {
  match (current, update) {
    (Some(Value::Object(mut base)), Value::Object(fields)) => {
      for (name, value) in fields {
        base.insert(name.clone(), value.clone());
      }
      Value::Object(base)
    }
    _ => update.clone(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, VisitStatus};
  use crate::clock::ManualClock;
  use crate::error::RemoteError;
  use crate::remote::InMemoryRemote;
  use crate::store::MemoryStore;
  use chrono::{TimeZone, Utc};
  use serde_json::json;

  async fn context(
    store: Arc<MemoryStore>,
    remote: Arc<InMemoryRemote>,
    clock: Arc<ManualClock>,
  ) -> OfflineContext {
    OfflineContext::open(store, remote, clock, OfflineSettings::default()).await
  }

  fn morning() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
      Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap(),
    ))
  }

  #[tokio::test]
  async fn test_write_is_visible_before_sync() {
    let remote = Arc::new(InMemoryRemote::new());
    let ctx = context(Arc::new(MemoryStore::new()), remote.clone(), morning()).await;

    let receipt = ctx
      .write(
        EntityType::Order,
        OperationKind::Create,
        "UUID-1",
        json!({"retailer_id": "R1", "total": 120}),
      )
      .await;

    assert_eq!(receipt.local, Durability::Durable);
    assert_eq!(ctx.remote_state(receipt.op_id()), RemoteCommit::Pending);
    assert_eq!(
      ctx.snapshot(EntityType::Order, "UUID-1").await,
      Some(json!({"retailer_id": "R1", "total": 120}))
    );
    assert!(ctx.registry().needs_refresh("UUID-1"));
    assert_eq!(remote.row_count("orders"), 0);

    ctx.engine().drain().await;
    assert_eq!(ctx.remote_state(receipt.op_id()), RemoteCommit::Settled);
    assert_eq!(remote.row_count("orders"), 1);
  }

  #[tokio::test]
  async fn test_update_merges_into_snapshot_and_delete_removes_it() {
    let ctx = context(
      Arc::new(MemoryStore::new()),
      Arc::new(InMemoryRemote::new()),
      morning(),
    )
    .await;

    ctx
      .write(EntityType::Order, OperationKind::Create, "K", json!({"a": 1, "b": 1}))
      .await;
    ctx
      .write(EntityType::Order, OperationKind::Update, "K", json!({"b": 2}))
      .await;
    assert_eq!(
      ctx.snapshot(EntityType::Order, "K").await,
      Some(json!({"a": 1, "b": 2}))
    );

    ctx
      .write(EntityType::Order, OperationKind::Delete, "K", Value::Null)
      .await;
    assert_eq!(ctx.snapshot(EntityType::Order, "K").await, None);
    assert_eq!(ctx.queue().len(), 3);
  }

  #[tokio::test]
  async fn test_storage_failure_degrades_to_memory() {
    let store = Arc::new(MemoryStore::new());
    let ctx = context(store.clone(), Arc::new(InMemoryRemote::new()), morning()).await;
    store.set_fail_writes(true);

    let receipt = ctx
      .write(EntityType::Attendance, OperationKind::Create, "A1", json!({"in": "09:00"}))
      .await;

    assert_eq!(receipt.local, Durability::MemoryOnly);
    assert_eq!(
      ctx.snapshot(EntityType::Attendance, "A1").await,
      Some(json!({"in": "09:00"}))
    );
    assert_eq!(ctx.pending_summary().total, 1);
  }

  #[tokio::test]
  async fn test_rejected_write_needs_attention() {
    let remote = Arc::new(InMemoryRemote::new());
    let ctx = context(Arc::new(MemoryStore::new()), remote.clone(), morning()).await;
    remote.reject_key(
      "INV-1",
      RemoteError::Rejected {
        status: 422,
        message: "total must be positive".to_string(),
      },
    );

    let receipt = ctx
      .write(EntityType::Invoice, OperationKind::Create, "INV-1", json!({"total": -5}))
      .await;
    ctx.engine().drain().await;

    assert_eq!(ctx.remote_state(receipt.op_id()), RemoteCommit::NeedsAttention);
    assert_eq!(ctx.pending_summary().needs_attention, 1);
  }

  #[tokio::test]
  async fn test_visit_write_updates_status_cache_locally() {
    let clock = morning();
    let ctx = context(
      Arc::new(MemoryStore::new()),
      Arc::new(InMemoryRemote::new()),
      clock.clone(),
    )
    .await;

    ctx
      .write(
        EntityType::Visit,
        OperationKind::Update,
        "visit-9",
        json!({
          "status": "unproductive",
          "user_id": "rep-1",
          "business_date": "2026-10-16",
          "no_order_reason": "shop closed",
        }),
      )
      .await;

    let key = StatusKey::new("visit-9", "rep-1", clock.today());
    let entry = ctx.status_cache().get(&key).unwrap();
    assert_eq!(entry.status, VisitStatus::Unproductive);
    assert!(!ctx.status_cache().should_refresh_from_network(&key));
  }

  #[tokio::test]
  async fn test_day_rollover_resets_day_scoped_state() {
    let clock = morning();
    let store = Arc::new(MemoryStore::new());
    let ctx = context(store.clone(), Arc::new(InMemoryRemote::new()), clock.clone()).await;

    assert!(!ctx.roll_day_if_needed().await);

    let yesterday = StatusKey::new("visit-1", "rep-1", clock.today());
    ctx
      .status_cache()
      .set(yesterday.clone(), VisitStatus::Productive, Default::default());
    ctx.registry().mark_for_refresh("visit-1");
    assert!(!ctx.roll_day_if_needed().await);

    clock.advance(chrono::Duration::days(1));
    assert!(ctx.roll_day_if_needed().await);

    let today = StatusKey::new("visit-1", "rep-1", clock.today());
    assert!(ctx.status_cache().should_refresh_from_network(&today));
    assert!(ctx.status_cache().get(&yesterday).is_none());
    assert!(!ctx.registry().needs_refresh("visit-1"));

    // Persisted date survives a restart
    ctx.flush().await;
    let restarted = context(store, Arc::new(InMemoryRemote::new()), clock).await;
    assert!(!restarted.roll_day_if_needed().await);
  }

  #[tokio::test]
  async fn test_visit_status_read_is_cache_first() {
    let clock = morning();
    let remote = Arc::new(InMemoryRemote::new());
    let ctx = context(Arc::new(MemoryStore::new()), remote.clone(), clock.clone()).await;
    let key = StatusKey::new("visit-4", "rep-1", clock.today());

    remote
      .upsert(
        "visits",
        &[json!({"id": "visit-4", "status": "in_progress", "order_value": 0})],
      )
      .await
      .unwrap();
    let fresh = ctx.read_visit_status(&key).await.unwrap();
    assert_eq!(fresh.source, CacheSource::Network);
    assert_eq!(fresh.data.unwrap().status, VisitStatus::InProgress);

    // Offline falls back to what the cache has
    ctx.connectivity().platform_signal(false);
    let cached = ctx.read_visit_status(&key).await.unwrap();
    assert_eq!(cached.source, CacheSource::Offline);
    ctx.connectivity().platform_signal(true);

    // A final status is served without asking the remote store
    ctx.status_cache().invalidate(&key);
    ctx
      .status_cache()
      .set(key.clone(), VisitStatus::Productive, Default::default());
    remote.set_offline(true);
    let final_hit = ctx.read_visit_status(&key).await.unwrap();
    assert_eq!(final_hit.source, CacheSource::Cache);
    assert_eq!(final_hit.data.unwrap().status, VisitStatus::Productive);
  }

  #[tokio::test]
  async fn test_pending_visit_write_wins_over_remote_read() {
    let clock = morning();
    let remote = Arc::new(InMemoryRemote::new());
    let ctx = context(Arc::new(MemoryStore::new()), remote.clone(), clock.clone()).await;
    let key = StatusKey::new("v1", "rep-1", clock.today());

    remote
      .upsert("visits", &[json!({"id": "v1", "status": "planned"})])
      .await
      .unwrap();
    let receipt = ctx
      .write(
        EntityType::Visit,
        OperationKind::Update,
        "v1",
        json!({"status": "in_progress", "user_id": "rep-1", "business_date": "2026-10-16"}),
      )
      .await;
    assert_eq!(ctx.remote_state(receipt.op_id()), RemoteCommit::Pending);

    let read = ctx.read_visit_status(&key).await.unwrap();
    assert_eq!(read.source, CacheSource::Cache);
    assert_eq!(read.data.unwrap().status, VisitStatus::InProgress);
    assert_eq!(
      ctx.status_cache().get(&key).map(|e| e.status),
      Some(VisitStatus::InProgress)
    );

    // Once synced, reads go back to the remote store
    ctx.engine().drain().await;
    let read = ctx.read_visit_status(&key).await.unwrap();
    assert_eq!(read.source, CacheSource::Network);
    assert_eq!(read.data.unwrap().status, VisitStatus::InProgress);
  }

  #[test]
  fn test_new_target_keys_are_unique() {
    let a = OfflineContext::new_target_key();
    let b = OfflineContext::new_target_key();
    assert_ne!(a, b);
    assert!(Uuid::parse_str(&a).is_ok());
  }
}
