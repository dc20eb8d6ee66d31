//! Queued write operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Remote resources the queue writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
  Visit,
  Order,
  OrderItem,
  Attendance,
  Invoice,
}

impl EntityType {
  /// Remote table name.
  pub fn table(self) -> &'static str {
    match self {
      EntityType::Visit => "visits",
      EntityType::Order => "orders",
      EntityType::OrderItem => "order_items",
      EntityType::Attendance => "attendance",
      EntityType::Invoice => "invoices",
    }
  }
}

impl std::str::FromStr for EntityType {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "visit" | "visits" => Ok(EntityType::Visit),
      "order" | "orders" => Ok(EntityType::Order),
      "order_item" | "order_items" => Ok(EntityType::OrderItem),
      "attendance" => Ok(EntityType::Attendance),
      "invoice" | "invoices" => Ok(EntityType::Invoice),
      other => Err(format!("unknown entity type: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
  Create,
  Update,
  Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
  /// Never attempted, or reset by the operator.
  Pending,
  /// Last attempt failed for a transient reason.
  Retrying,
  /// The remote store rejected the write; waits for the operator.
  NeedsAttention,
}

/// A write requested by the app, before it is queued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
  pub entity_type: EntityType,
  pub kind: OperationKind,
  /// Client-assigned key shared by the local and remote copies.
  pub target_key: String,
  /// Record fields for create/update; ignored for delete.
  pub payload: Value,
}

impl NewOperation {
  pub fn create(entity_type: EntityType, target_key: impl Into<String>, payload: Value) -> Self {
    Self {
      entity_type,
      kind: OperationKind::Create,
      target_key: target_key.into(),
      payload,
    }
  }

  pub fn update(entity_type: EntityType, target_key: impl Into<String>, payload: Value) -> Self {
    Self {
      entity_type,
      kind: OperationKind::Update,
      target_key: target_key.into(),
      payload,
    }
  }

  pub fn delete(entity_type: EntityType, target_key: impl Into<String>) -> Self {
    Self {
      entity_type,
      kind: OperationKind::Delete,
      target_key: target_key.into(),
      payload: Value::Null,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
  pub id: Uuid,
  /// Position in enqueue order; strictly increasing across restarts.
  pub seq: u64,
  pub entity_type: EntityType,
  pub kind: OperationKind,
  pub target_key: String,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  pub attempts: u32,
  pub last_error: Option<String>,
  pub last_attempt_at: Option<DateTime<Utc>>,
  pub status: OperationStatus,
}

impl QueuedOperation {
  /// Bulk writes carry an array payload and get the longer timeout.
  pub fn is_bulk(&self) -> bool {
    self.payload.is_array()
  }
}

/// Counts for the "N pending sync" badge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingSummary {
  pub total: usize,
  pub retrying: usize,
  pub needs_attention: usize,
}
