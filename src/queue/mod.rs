//! Durable queue of writes waiting for the remote store.
//!
//! Every write that must eventually reach the server goes through here in
//! enqueue order. Entries leave the queue only when the sync engine confirms
//! the remote write, or when the operator explicitly clears the queue.

mod types;

pub use types::{
  EntityType, NewOperation, OperationKind, OperationStatus, PendingSummary, QueuedOperation,
};

use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::StorageError;
use crate::store::{open_envelope, seal, Durability, KeyValueStore, Namespace};

#[derive(Default)]
struct QueueState {
  ops: Vec<QueuedOperation>,
  next_seq: u64,
  /// Operations whose latest state could not be persisted.
  volatile: HashSet<Uuid>,
  /// Keys of settled operations whose removal from storage failed.
  stale_keys: Vec<String>,
}

pub struct SyncQueue {
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  state: Mutex<QueueState>,
  /// Serializes storage writes so a slow write never lands after a newer one.
  write_lane: tokio::sync::Mutex<()>,
  unreadable: usize,
}

fn storage_key(seq: u64, id: Uuid) -> String {
  Namespace::Queue.key(&format!("{:020}:{}", seq, id))
}

fn seq_from_key(key: &str) -> Option<u64> {
  Namespace::Queue.local(key)?.split(':').next()?.parse().ok()
}

impl SyncQueue {
  /// Load the queue persisted by a previous session.
  ///
  /// Unreadable entries are left in the store untouched and skipped; they are
  /// counted in [`SyncQueue::unreadable_entries`].
  pub async fn load(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
    let mut state = QueueState::default();
    let mut unreadable = 0;

    let stored = match store.get_all(Namespace::Queue.prefix()).await {
      Ok(stored) => stored,
      Err(e) => {
        error!(error = %e, "sync queue could not be loaded");
        Vec::new()
      }
    };

    for (key, raw) in stored {
      if let Some(seq) = seq_from_key(&key) {
        state.next_seq = state.next_seq.max(seq + 1);
      }
      match open_envelope::<QueuedOperation>(&key, raw) {
        Ok(op) => state.ops.push(op),
        Err(e) => {
          error!(error = %e, "queued operation is unreadable, leaving it in storage");
          unreadable += 1;
        }
      }
    }

    state.ops.sort_by_key(|op| op.seq);
    if !state.ops.is_empty() {
      info!(pending = state.ops.len(), "restored sync queue");
    }

    Self {
      store,
      clock,
      state: Mutex::new(state),
      write_lane: tokio::sync::Mutex::new(()),
      unreadable,
    }
  }

  /// Queue a write. Never fails: if storage is unavailable the operation is
  /// kept in memory for this session.
  pub async fn enqueue(&self, new: NewOperation) -> QueuedOperation {
    let op = {
      let mut state = self.lock();
      let op = QueuedOperation {
        id: Uuid::new_v4(),
        seq: state.next_seq,
        entity_type: new.entity_type,
        kind: new.kind,
        target_key: new.target_key,
        payload: new.payload,
        enqueued_at: self.clock.now(),
        attempts: 0,
        last_error: None,
        last_attempt_at: None,
        status: OperationStatus::Pending,
      };
      state.next_seq += 1;
      state.ops.push(op.clone());
      op
    };

    self.persist(op.seq, op.id).await;
    op
  }

  /// Snapshot of the queue in enqueue order.
  pub fn peek_all(&self) -> Vec<QueuedOperation> {
    self.lock().ops.clone()
  }

  pub fn get(&self, id: Uuid) -> Option<QueuedOperation> {
    self.lock().ops.iter().find(|op| op.id == id).cloned()
  }

  pub fn len(&self) -> usize {
    self.lock().ops.len()
  }

  /// Whether a write to this record is still waiting for the remote store.
  pub fn has_unsettled(&self, entity_type: EntityType, target_key: &str) -> bool {
    self
      .lock()
      .ops
      .iter()
      .any(|op| op.entity_type == entity_type && op.target_key == target_key)
  }

  pub fn is_empty(&self) -> bool {
    self.lock().ops.is_empty()
  }

  pub fn pending_summary(&self) -> PendingSummary {
    let state = self.lock();
    let mut summary = PendingSummary {
      total: state.ops.len(),
      ..PendingSummary::default()
    };
    for op in &state.ops {
      match op.status {
        OperationStatus::Retrying => summary.retrying += 1,
        OperationStatus::NeedsAttention => summary.needs_attention += 1,
        OperationStatus::Pending => {}
      }
    }
    summary
  }

  /// Whether the latest state of `id` reached durable storage.
  pub fn durability(&self, id: Uuid) -> Durability {
    if self.lock().volatile.contains(&id) {
      Durability::MemoryOnly
    } else {
      Durability::Durable
    }
  }

  /// Persisted entries that could not be read at load time.
  pub fn unreadable_entries(&self) -> usize {
    self.unreadable
  }

  /// Remove a confirmed operation.
  pub(crate) async fn dequeue(&self, id: Uuid) -> Option<QueuedOperation> {
    let removed = {
      let mut state = self.lock();
      let index = state.ops.iter().position(|op| op.id == id)?;
      state.volatile.remove(&id);
      state.ops.remove(index)
    };

    self.persist(removed.seq, removed.id).await;
    Some(removed)
  }

  /// Stored copies of settled operations that could not be removed yet.
  ///
  /// They are retried before every later storage write.
  pub fn stale_entries(&self) -> usize {
    self.lock().stale_keys.len()
  }

  /// Record a transient failure; the operation stays queued.
  pub(crate) async fn mark_failed(&self, id: Uuid, error: &str) {
    self
      .update(id, |op, now| {
        op.attempts += 1;
        op.last_error = Some(error.to_string());
        op.last_attempt_at = Some(now);
        op.status = OperationStatus::Retrying;
      })
      .await;
  }

  /// Record a definitive rejection; the operation stays queued for the operator.
  pub(crate) async fn mark_rejected(&self, id: Uuid, error: &str) {
    self
      .update(id, |op, now| {
        op.attempts += 1;
        op.last_error = Some(error.to_string());
        op.last_attempt_at = Some(now);
        op.status = OperationStatus::NeedsAttention;
      })
      .await;
  }

  /// Put a rejected operation back in line. Returns false if it is not
  /// waiting for attention.
  pub async fn retry(&self, id: Uuid) -> bool {
    self
      .update_if(
        id,
        |op| op.status == OperationStatus::NeedsAttention,
        |op, _| {
          op.status = OperationStatus::Pending;
          op.last_attempt_at = None;
        },
      )
      .await
  }

  /// Edit the payload of a rejected operation and put it back in line.
  pub async fn replace_payload(&self, id: Uuid, payload: Value) -> bool {
    self
      .update_if(
        id,
        |op| op.status == OperationStatus::NeedsAttention,
        move |op, _| {
          op.payload = payload;
          op.status = OperationStatus::Pending;
          op.last_attempt_at = None;
        },
      )
      .await
  }

  /// Drop every queued operation. Only for an explicit operator action.
  pub async fn clear(&self) -> Result<usize, StorageError> {
    let _lane = self.write_lane.lock().await;
    let removed = {
      let mut state = self.lock();
      state.volatile.clear();
      state.stale_keys.clear();
      std::mem::take(&mut state.ops)
    };

    warn!(count = removed.len(), "sync queue cleared by user");
    for (key, _) in self.store.get_all(Namespace::Queue.prefix()).await? {
      self.store.remove(&key).await?;
    }
    Ok(removed.len())
  }

  async fn update<F>(&self, id: Uuid, apply: F)
  where
    F: FnOnce(&mut QueuedOperation, chrono::DateTime<chrono::Utc>),
  {
    self.update_if(id, |_| true, apply).await;
  }

  async fn update_if<P, F>(&self, id: Uuid, guard: P, apply: F) -> bool
  where
    P: FnOnce(&QueuedOperation) -> bool,
    F: FnOnce(&mut QueuedOperation, chrono::DateTime<chrono::Utc>),
  {
    let now = self.clock.now();
    let updated = {
      let mut state = self.lock();
      state
        .ops
        .iter_mut()
        .find(|op| op.id == id)
        .filter(|op| guard(op))
        .map(|op| {
          apply(op, now);
          op.clone()
        })
    };

    match updated {
      Some(op) => {
        self.persist(op.seq, op.id).await;
        true
      }
      None => false,
    }
  }

  /// Bring the stored copy of one operation in line with memory.
  ///
  /// Writes whatever the operation looks like once the lane is free, or
  /// removes the stored copy if it has left the queue in the meantime.
  async fn persist(&self, seq: u64, id: Uuid) {
    let _lane = self.write_lane.lock().await;
    self.retry_stale_removals().await;

    let key = storage_key(seq, id);
    match self.get(id) {
      Some(op) => {
        let result = match seal(&op) {
          Ok(value) => self.store.set(&key, &value).await,
          Err(e) => Err(e),
        };
        let mut state = self.lock();
        match result {
          Ok(()) => {
            state.volatile.remove(&id);
          }
          Err(e) => {
            warn!(op = %id, error = %e, "queued operation kept in memory only");
            if state.ops.iter().any(|queued| queued.id == id) {
              state.volatile.insert(id);
            }
          }
        }
      }
      None => {
        if let Err(e) = self.store.remove(&key).await {
          error!(op = %id, error = %e, "settled operation still in storage, will retry removal");
          self.lock().stale_keys.push(key);
        }
      }
    }
  }

  async fn retry_stale_removals(&self) {
    let stale = std::mem::take(&mut self.lock().stale_keys);
    for key in stale {
      if let Err(e) = self.store.remove(&key).await {
        warn!(key = %key, error = %e, "removal of settled operation failed again");
        self.lock().stale_keys.push(key);
      }
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::SystemClock;
  use crate::store::MemoryStore;
  use serde_json::json;

  async fn queue_on(store: Arc<MemoryStore>) -> SyncQueue {
    SyncQueue::load(store, Arc::new(SystemClock)).await
  }

  #[tokio::test]
  async fn test_enqueue_preserves_order_across_restart() {
    let store = Arc::new(MemoryStore::new());
    let queue = queue_on(store.clone()).await;

    let a = queue
      .enqueue(NewOperation::update(EntityType::Order, "K", json!({"qty": 1})))
      .await;
    let b = queue
      .enqueue(NewOperation::update(EntityType::Order, "K", json!({"qty": 2})))
      .await;

    let restarted = queue_on(store).await;
    let ids: Vec<_> = restarted.peek_all().iter().map(|op| op.id).collect();
    assert_eq!(ids, vec![a.id, b.id]);

    let c = restarted
      .enqueue(NewOperation::create(EntityType::Visit, "V", json!({})))
      .await;
    assert!(c.seq > b.seq);
  }

  #[tokio::test]
  async fn test_failures_keep_operation_queued() {
    let store = Arc::new(MemoryStore::new());
    let queue = queue_on(store.clone()).await;
    let op = queue
      .enqueue(NewOperation::create(EntityType::Order, "K", json!({})))
      .await;

    queue.mark_failed(op.id, "timeout").await;
    queue.mark_rejected(op.id, "HTTP 422").await;

    let restarted = queue_on(store).await;
    let stored = restarted.get(op.id).unwrap();
    assert_eq!(stored.attempts, 2);
    assert_eq!(stored.last_error.as_deref(), Some("HTTP 422"));
    assert_eq!(stored.status, OperationStatus::NeedsAttention);
    assert_eq!(restarted.pending_summary().needs_attention, 1);
  }

  #[tokio::test]
  async fn test_enqueue_survives_storage_failure() {
    let store = Arc::new(MemoryStore::new());
    store.set_fail_writes(true);
    let queue = queue_on(store.clone()).await;

    let op = queue
      .enqueue(NewOperation::create(EntityType::Order, "K", json!({})))
      .await;
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.durability(op.id), Durability::MemoryOnly);

    store.set_fail_writes(false);
    queue.mark_failed(op.id, "offline").await;
    assert_eq!(queue.durability(op.id), Durability::Durable);
  }

  #[tokio::test]
  async fn test_retry_and_edit_only_apply_to_rejected() {
    let queue = queue_on(Arc::new(MemoryStore::new())).await;
    let op = queue
      .enqueue(NewOperation::create(EntityType::Order, "K", json!({"total": -1})))
      .await;

    assert!(!queue.retry(op.id).await);

    queue.mark_rejected(op.id, "total must be positive").await;
    assert!(queue.replace_payload(op.id, json!({"total": 5})).await);

    let edited = queue.get(op.id).unwrap();
    assert_eq!(edited.status, OperationStatus::Pending);
    assert_eq!(edited.payload, json!({"total": 5}));
  }

  #[tokio::test]
  async fn test_clear_wipes_memory_and_storage() {
    let store = Arc::new(MemoryStore::new());
    let queue = queue_on(store.clone()).await;
    queue
      .enqueue(NewOperation::create(EntityType::Order, "K1", json!({})))
      .await;
    queue
      .enqueue(NewOperation::delete(EntityType::Order, "K2"))
      .await;

    assert_eq!(queue.clear().await.unwrap(), 2);
    assert!(queue.is_empty());
    assert!(queue_on(store).await.is_empty());
  }

  #[tokio::test]
  async fn test_unreadable_entry_is_left_in_place() {
    let store = Arc::new(MemoryStore::new());
    store.insert_raw("queue:00000000000000000007:bad", json!("not an envelope"));

    let queue = queue_on(store.clone()).await;
    assert!(queue.is_empty());
    assert_eq!(queue.unreadable_entries(), 1);
    assert!(store
      .get("queue:00000000000000000007:bad")
      .await
      .unwrap()
      .is_some());

    let op = queue
      .enqueue(NewOperation::create(EntityType::Order, "K", json!({})))
      .await;
    assert_eq!(op.seq, 8);
  }

  #[tokio::test]
  async fn test_slow_enqueue_write_cannot_bring_back_a_synced_operation() {
    let store = Arc::new(MemoryStore::new());
    store.set_write_delay(std::time::Duration::from_millis(50));
    let queue = Arc::new(queue_on(store.clone()).await);

    let writer = {
      let queue = Arc::clone(&queue);
      tokio::spawn(async move {
        queue
          .enqueue(NewOperation::create(EntityType::Order, "K", json!({"qty": 1})))
          .await
      })
    };
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    // Confirmed by the remote while its first write is still in flight
    let queued = queue.peek_all();
    assert_eq!(queued.len(), 1);
    assert!(queue.dequeue(queued[0].id).await.is_some());
    writer.await.unwrap();

    assert!(queue.is_empty());
    assert!(queue_on(store.clone()).await.is_empty());
    assert!(store.get_all("queue:").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_stored_copy_tracks_latest_state() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(queue_on(store.clone()).await);
    let op = queue
      .enqueue(NewOperation::create(EntityType::Order, "K", json!({})))
      .await;

    store.set_write_delay(std::time::Duration::from_millis(30));
    let first = {
      let queue = Arc::clone(&queue);
      tokio::spawn(async move { queue.mark_failed(op.id, "timeout").await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    queue.mark_rejected(op.id, "HTTP 422").await;
    first.await.unwrap();

    let restarted = queue_on(store).await;
    let stored = restarted.get(op.id).unwrap();
    assert_eq!(stored.status, OperationStatus::NeedsAttention);
    assert_eq!(stored.attempts, 2);
  }

  #[tokio::test]
  async fn test_half_written_sqlite_row_is_counted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    let store = Arc::new(crate::store::SqliteStore::open(&path).unwrap());
    rusqlite::Connection::open(&path)
      .unwrap()
      .execute(
        "INSERT INTO kv (key, value) VALUES (?1, ?2)",
        rusqlite::params!["queue:00000000000000000011:torn", "{\"id\": "],
      )
      .unwrap();

    let queue = SyncQueue::load(store, Arc::new(SystemClock)).await;
    assert!(queue.is_empty());
    assert_eq!(queue.unreadable_entries(), 1);

    let op = queue
      .enqueue(NewOperation::create(EntityType::Order, "K", json!({})))
      .await;
    assert_eq!(op.seq, 12);
  }

  #[test]
  fn test_entity_type_parse() {
    assert_eq!("orders".parse::<EntityType>(), Ok(EntityType::Order));
    assert_eq!(EntityType::OrderItem.table(), "order_items");
    assert!("widgets".parse::<EntityType>().is_err());
  }
}
