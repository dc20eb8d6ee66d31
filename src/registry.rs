//! Targeted cache invalidation.
//!
//! Components register interest in one entity and get called back when that
//! entity is marked dirty, so a mutation only re-reads the rows it touched
//! instead of refetching whole lists.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tokio::runtime::Handle;
use tracing::debug;

pub type RefreshCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Inner {
  listeners: HashMap<String, Vec<(u64, RefreshCallback)>>,
  dirty: HashSet<String>,
  initial_checked: HashSet<String>,
  next_id: u64,
}

#[derive(Default)]
pub struct InvalidationRegistry {
  inner: Arc<Mutex<Inner>>,
}

/// Handle returned by [`InvalidationRegistry::register`].
///
/// Dropping it unregisters the callback.
pub struct Registration {
  inner: Weak<Mutex<Inner>>,
  entity_id: String,
  id: u64,
}

impl Registration {
  pub fn unregister(self) {
    // Drop does the work
  }
}

impl Drop for Registration {
  fn drop(&mut self) {
    let Some(inner) = self.inner.upgrade() else {
      return;
    };
    let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(listeners) = inner.listeners.get_mut(&self.entity_id) {
      listeners.retain(|(id, _)| *id != self.id);
      if listeners.is_empty() {
        inner.listeners.remove(&self.entity_id);
      }
    }
  }
}

impl InvalidationRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register interest in `entity_id`.
  ///
  /// If the entity is already dirty, the callback is scheduled once on the
  /// runtime rather than invoked inline, so registration never re-enters the
  /// caller. It is skipped if the registration is gone by then. Outside a
  /// runtime the listener just waits for the next mark.
  pub fn register<F>(&self, entity_id: &str, callback: F) -> Registration
  where
    F: Fn(&str) + Send + Sync + 'static,
  {
    let callback: RefreshCallback = Arc::new(callback);
    let (id, already_dirty) = {
      let mut inner = self.lock();
      let id = inner.next_id;
      inner.next_id += 1;
      inner
        .listeners
        .entry(entity_id.to_string())
        .or_default()
        .push((id, Arc::clone(&callback)));
      (id, inner.dirty.contains(entity_id))
    };

    if already_dirty {
      match Handle::try_current() {
        Ok(runtime) => {
          let inner = Arc::downgrade(&self.inner);
          let entity = entity_id.to_string();
          runtime.spawn(async move {
            if is_registered(&inner, &entity, id) {
              callback(&entity);
            }
          });
        }
        Err(_) => debug!(entity = %entity_id, "no runtime, catch-up waits for the next mark"),
      }
    }

    Registration {
      inner: Arc::downgrade(&self.inner),
      entity_id: entity_id.to_string(),
      id,
    }
  }

  /// Mark dirty and notify current listeners.
  pub fn mark_for_refresh(&self, entity_id: &str) {
    let callbacks = {
      let mut inner = self.lock();
      inner.dirty.insert(entity_id.to_string());
      inner
        .listeners
        .get(entity_id)
        .map(|l| l.iter().map(|(_, cb)| Arc::clone(cb)).collect::<Vec<_>>())
        .unwrap_or_default()
    };

    debug!(entity = %entity_id, listeners = callbacks.len(), "marked for refresh");
    for callback in callbacks {
      callback(entity_id);
    }
  }

  pub fn mark_multiple_for_refresh<I, S>(&self, entity_ids: I)
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    for entity_id in entity_ids {
      self.mark_for_refresh(entity_id.as_ref());
    }
  }

  pub fn needs_refresh(&self, entity_id: &str) -> bool {
    self.lock().dirty.contains(entity_id)
  }

  pub fn clear_refresh_flag(&self, entity_id: &str) {
    self.lock().dirty.remove(entity_id);
  }

  /// Record that a component finished its first load for `entity_id`.
  pub fn mark_initial_check_done(&self, entity_id: &str) {
    self.lock().initial_checked.insert(entity_id.to_string());
  }

  pub fn is_initial_check_done(&self, entity_id: &str) -> bool {
    self.lock().initial_checked.contains(entity_id)
  }

  /// Forget dirty flags and first-load markers when the business day rolls over.
  pub fn reset_for_date_change(&self) {
    let mut inner = self.lock();
    inner.dirty.clear();
    inner.initial_checked.clear();
  }

  pub fn listener_count(&self, entity_id: &str) -> usize {
    self.lock().listeners.get(entity_id).map(Vec::len).unwrap_or(0)
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
    self.inner.lock().unwrap_or_else(|e| e.into_inner())
  }
}

fn is_registered(inner: &Weak<Mutex<Inner>>, entity_id: &str, id: u64) -> bool {
  let Some(inner) = inner.upgrade() else {
    return false;
  };
  let inner = inner.lock().unwrap_or_else(|e| e.into_inner());
  inner
    .listeners
    .get(entity_id)
    .is_some_and(|listeners| listeners.iter().any(|(listener, _)| *listener == id))
}
