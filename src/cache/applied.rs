//! In-progress user selections scoped to a parent context.
//!
//! A context is an ordered list of parent identifiers (visit, retailer, ...).
//! Each distinct context gets its own slot, so switching retailer within the
//! same visit never sees the other retailer's selections.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::error::StorageError;
use crate::store::{open_envelope, seal, Durability, KeyValueStore, Namespace};

/// Composite key made of `(name, id)` parts, e.g. `visit=1, retailer=A`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextKey(Vec<(String, String)>);

impl ContextKey {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, name: impl Into<String>, id: impl Into<String>) -> Self {
    self.0.push((name.into(), id.into()));
    self
  }

  pub fn parts(&self) -> &[(String, String)] {
    &self.0
  }

  /// Stable, fixed-length hash of the parts.
  fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    for (name, id) in &self.0 {
      // Length prefixes keep ("ab","c") and ("a","bc") apart
      hasher.update((name.len() as u64).to_le_bytes());
      hasher.update(name.as_bytes());
      hasher.update((id.len() as u64).to_le_bytes());
      hasher.update(id.as_bytes());
    }
    hex::encode(hasher.finalize())
  }
}

impl std::fmt::Display for ContextKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let parts: Vec<String> = self.0.iter().map(|(n, id)| format!("{}={}", n, id)).collect();
    write!(f, "{}", parts.join(","))
  }
}

#[derive(Serialize, Deserialize)]
struct StoredState<T> {
  context: ContextKey,
  value: T,
}

/// Per-context state for one feature (e.g. applied schemes on an order).
pub struct AppliedStateCache<T> {
  feature: String,
  store: Arc<dyn KeyValueStore>,
  memory: Mutex<HashMap<ContextKey, T>>,
}

impl<T> AppliedStateCache<T>
where
  T: Clone + Serialize + DeserializeOwned + Send + Sync,
{
  pub fn new(feature: impl Into<String>, store: Arc<dyn KeyValueStore>) -> Self {
    Self {
      feature: feature.into(),
      store,
      memory: Mutex::new(HashMap::new()),
    }
  }

  fn prefix(&self) -> String {
    Namespace::Applied.key(&format!("{}:", self.feature))
  }

  fn storage_key(&self, context: &ContextKey) -> String {
    format!("{}{}", self.prefix(), context.cache_hash())
  }

  /// State for `context`, from memory first, then the store.
  pub async fn get(&self, context: &ContextKey) -> Option<T> {
    if let Some(value) = self.lock().get(context) {
      return Some(value.clone());
    }

    let key = self.storage_key(context);
    let raw = match self.store.get(&key).await {
      Ok(raw) => raw?,
      Err(e) => {
        warn!(context = %context, error = %e, "applied state unreadable");
        return None;
      }
    };

    match open_envelope::<StoredState<T>>(&key, raw) {
      Ok(stored) if &stored.context == context => {
        self.lock().insert(context.clone(), stored.value.clone());
        Some(stored.value)
      }
      Ok(_) => {
        warn!(context = %context, "applied state belongs to another context, ignoring");
        None
      }
      Err(e) => {
        warn!(error = %e, "discarding corrupted applied state");
        if let Err(e) = self.store.remove(&key).await {
          warn!(key = %key, error = %e, "failed to remove corrupted applied state");
        }
        None
      }
    }
  }

  /// Replace the state for `context`.
  ///
  /// The value is always kept in memory; a storage failure only downgrades
  /// durability.
  pub async fn set(&self, context: &ContextKey, value: T) -> Durability {
    self.lock().insert(context.clone(), value.clone());

    let stored = StoredState {
      context: context.clone(),
      value,
    };
    match self.write(context, &stored).await {
      Ok(()) => Durability::Durable,
      Err(e) => {
        warn!(context = %context, error = %e, "applied state kept in memory only");
        Durability::MemoryOnly
      }
    }
  }

  pub async fn remove(&self, context: &ContextKey) {
    self.lock().remove(context);
    if let Err(e) = self.store.remove(&self.storage_key(context)).await {
      warn!(context = %context, error = %e, "failed to remove applied state");
    }
  }

  /// Drop every context for this feature.
  pub async fn clear_all(&self) -> Result<(), StorageError> {
    self.lock().clear();
    for (key, _) in self.store.get_all(&self.prefix()).await? {
      self.store.remove(&key).await?;
    }
    Ok(())
  }

  async fn write(&self, context: &ContextKey, stored: &StoredState<T>) -> Result<(), StorageError> {
    let value = seal(stored)?;
    self.store.set(&self.storage_key(context), &value).await
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ContextKey, T>> {
    self.memory.lock().unwrap_or_else(|e| e.into_inner())
  }
}
