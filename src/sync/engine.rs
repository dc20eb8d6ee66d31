//! Drains the sync queue against the remote store.

use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::Backoff;
use crate::cache::{RemoteStatus, StatusCache, StatusKey, VisitStatus};
use crate::clock::Clock;
use crate::error::RemoteError;
use crate::queue::{EntityType, OperationKind, OperationStatus, QueuedOperation, SyncQueue};
use crate::registry::InvalidationRegistry;
use crate::remote::{RemoteStore, KEY_COLUMN};

/// Visit payload fields copied into the status cache for instant display.
const DERIVED_VISIT_FIELDS: &[&str] = &["order_value", "no_order_reason"];

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
  pub request_timeout: Duration,
  pub bulk_timeout: Duration,
  pub backoff: Backoff,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      request_timeout: Duration::from_secs(15),
      bulk_timeout: Duration::from_secs(30),
      backoff: Backoff::default(),
    }
  }
}

/// A write the remote store refused; it stays queued for the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
  pub op_id: Uuid,
  pub entity_type: EntityType,
  pub target_key: String,
  pub error: RemoteError,
}

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
  pub synced: Vec<Uuid>,
  pub retried: Vec<Uuid>,
  pub rejected: Vec<Rejection>,
  pub skipped: Vec<Uuid>,
  /// Another drain was already running; it will pick up this request.
  pub coalesced: bool,
}

impl SyncReport {
  fn merge(&mut self, other: SyncReport) {
    self.synced.extend(other.synced);
    self.retried.extend(other.retried);
    self.rejected.extend(other.rejected);
    // Only the last pass says what is still waiting
    self.skipped = other.skipped;
  }
}

pub struct SyncEngine {
  queue: Arc<SyncQueue>,
  remote: Arc<dyn RemoteStore>,
  status_cache: Arc<StatusCache>,
  registry: Arc<InvalidationRegistry>,
  clock: Arc<dyn Clock>,
  settings: SyncSettings,
  in_flight: Mutex<HashSet<String>>,
  drain_lock: tokio::sync::Mutex<()>,
  rerun: AtomicBool,
}

/// Marks a target key as having a request in flight until dropped.
struct FlightGuard<'a> {
  in_flight: &'a Mutex<HashSet<String>>,
  key: String,
}

impl Drop for FlightGuard<'_> {
  fn drop(&mut self) {
    self
      .in_flight
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .remove(&self.key);
  }
}

impl SyncEngine {
  pub fn new(
    queue: Arc<SyncQueue>,
    remote: Arc<dyn RemoteStore>,
    status_cache: Arc<StatusCache>,
    registry: Arc<InvalidationRegistry>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
  ) -> Self {
    Self {
      queue,
      remote,
      status_cache,
      registry,
      clock,
      settings,
      in_flight: Mutex::new(HashSet::new()),
      drain_lock: tokio::sync::Mutex::new(()),
      rerun: AtomicBool::new(false),
    }
  }

  pub fn queue(&self) -> &Arc<SyncQueue> {
    &self.queue
  }

  /// Drain the queue in enqueue order.
  ///
  /// If a drain is already running the call returns immediately with a
  /// `coalesced` report and the running drain makes one more pass.
  pub async fn drain(&self) -> SyncReport {
    let Ok(_guard) = self.drain_lock.try_lock() else {
      self.rerun.store(true, Ordering::SeqCst);
      debug!("drain already running, coalescing");
      return SyncReport {
        coalesced: true,
        ..SyncReport::default()
      };
    };

    let mut report = SyncReport::default();
    loop {
      self.rerun.store(false, Ordering::SeqCst);
      report.merge(self.pass().await);
      if !self.rerun.swap(false, Ordering::SeqCst) {
        break;
      }
    }

    if !report.synced.is_empty() || !report.rejected.is_empty() {
      info!(
        synced = report.synced.len(),
        retried = report.retried.len(),
        rejected = report.rejected.len(),
        remaining = self.queue.len(),
        "sync drain finished"
      );
    }
    report
  }

  async fn pass(&self) -> SyncReport {
    let mut report = SyncReport::default();
    // Keys that must not advance in this pass, to keep per-key order
    let mut blocked: HashSet<String> = HashSet::new();
    let mut unreachable = false;
    let now = self.clock.now();

    for op in self.queue.peek_all() {
      if unreachable || blocked.contains(&op.target_key) {
        report.skipped.push(op.id);
        continue;
      }

      if op.status == OperationStatus::NeedsAttention
        || !self.settings.backoff.is_ready(&op, now)
      {
        blocked.insert(op.target_key.clone());
        report.skipped.push(op.id);
        continue;
      }

      let Some(_flight) = self.begin_flight(&op.target_key) else {
        debug!(key = %op.target_key, "write already in flight, skipping");
        blocked.insert(op.target_key.clone());
        report.skipped.push(op.id);
        continue;
      };

      match self.write(&op).await {
        Ok(()) => {
          self.queue.dequeue(op.id).await;
          self.after_success(&op);
          report.synced.push(op.id);
        }
        Err(e) if e.is_transient() => {
          warn!(op = %op.id, key = %op.target_key, error = %e, "sync write failed, will retry");
          self.queue.mark_failed(op.id, &e.to_string()).await;
          blocked.insert(op.target_key.clone());
          report.retried.push(op.id);
          // The rest of the pass would fail the same way
          unreachable = true;
        }
        Err(e) => {
          error!(op = %op.id, key = %op.target_key, error = %e, "sync write rejected");
          self.queue.mark_rejected(op.id, &e.to_string()).await;
          blocked.insert(op.target_key.clone());
          report.rejected.push(Rejection {
            op_id: op.id,
            entity_type: op.entity_type,
            target_key: op.target_key.clone(),
            error: e,
          });
        }
      }
    }

    report
  }

  fn begin_flight(&self, key: &str) -> Option<FlightGuard<'_>> {
    let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
    if !in_flight.insert(key.to_string()) {
      return None;
    }
    Some(FlightGuard {
      in_flight: &self.in_flight,
      key: key.to_string(),
    })
  }

  async fn write(&self, op: &QueuedOperation) -> Result<(), RemoteError> {
    let table = op.entity_type.table();
    let timeout = if op.is_bulk() {
      self.settings.bulk_timeout
    } else {
      self.settings.request_timeout
    };

    let rows = match op.kind {
      OperationKind::Delete => Vec::new(),
      OperationKind::Create | OperationKind::Update => rows_for(op)?,
    };

    let call = async {
      match op.kind {
        OperationKind::Delete => self.remote.delete(table, &op.target_key).await,
        OperationKind::Create | OperationKind::Update => self.remote.upsert(table, &rows).await,
      }
    };

    tokio::time::timeout(timeout, call)
      .await
      .unwrap_or(Err(RemoteError::Timeout(timeout)))
  }

  fn after_success(&self, op: &QueuedOperation) {
    if op.entity_type == EntityType::Visit && op.kind != OperationKind::Delete {
      if let Some((key, status, derived)) = visit_status(&op.target_key, &op.payload) {
        self.status_cache.set(key, status, derived);
      }
    }
    self.registry.mark_for_refresh(&op.target_key);
  }
}

/// Rows to upsert for a create/update. Single records get the target key as
/// their id; bulk rows must carry their own.
fn rows_for(op: &QueuedOperation) -> Result<Vec<Value>, RemoteError> {
  match &op.payload {
    Value::Array(rows) => {
      for row in rows {
        if row.get(KEY_COLUMN).is_none() {
          return Err(RemoteError::Schema(format!(
            "bulk {} row is missing {}",
            op.entity_type.table(),
            KEY_COLUMN
          )));
        }
      }
      Ok(rows.clone())
    }
    Value::Object(fields) => {
      let mut row = fields.clone();
      row.insert(KEY_COLUMN.to_string(), Value::String(op.target_key.clone()));
      Ok(vec![Value::Object(row)])
    }
    Value::Null => {
      let mut row = Map::new();
      row.insert(KEY_COLUMN.to_string(), Value::String(op.target_key.clone()));
      Ok(vec![Value::Object(row)])
    }
    other => Err(RemoteError::Schema(format!(
      "payload for {} must be an object or array, got {}",
      op.target_key, other
    ))),
  }
}

/// Status cache entry implied by a synced visit payload, if it carries one.
pub(crate) fn visit_status(
  target_key: &str,
  payload: &Value,
) -> Option<(StatusKey, VisitStatus, Map<String, Value>)> {
  let status = VisitStatus::parse(payload.get("status")?.as_str()?)?;
  let user_id = payload.get("user_id")?.as_str()?;
  let date: NaiveDate = payload.get("business_date")?.as_str()?.parse().ok()?;

  Some((
    StatusKey::new(target_key, user_id, date),
    status,
    derived_visit_fields(payload),
  ))
}

/// Status carried by a visit row read back from the remote store.
pub(crate) fn remote_visit_status(row: &Value) -> Option<RemoteStatus> {
  let status = VisitStatus::parse(row.get("status")?.as_str()?)?;
  Some(RemoteStatus {
    status,
    derived_fields: derived_visit_fields(row),
  })
}

fn derived_visit_fields(record: &Value) -> Map<String, Value> {
  DERIVED_VISIT_FIELDS
    .iter()
    .filter_map(|field| Some((field.to_string(), record.get(*field)?.clone())))
    .collect()
}
