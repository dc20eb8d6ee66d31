//! Online / offline / slow classification.
//!
//! Platform connectivity events apply immediately. Latency probes only flip
//! the state once enough consecutive probes agree, so a single dropped packet
//! does not make the app flap between modes. A persisted manual override can
//! force offline mode regardless of what is detected.

mod probe;

pub use probe::{spawn_probe_loop, HttpProber, Prober};

use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::store::{Durability, KeyValueStore, Namespace};

const FORCED_OFFLINE_KEY: &str = "forced_offline";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
  Online,
  OnlineSlow,
  Offline,
}

impl ConnectivityState {
  pub fn is_online(self) -> bool {
    !matches!(self, ConnectivityState::Offline)
  }
}

impl std::fmt::Display for ConnectivityState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      ConnectivityState::Online => "online",
      ConnectivityState::OnlineSlow => "online (slow)",
      ConnectivityState::Offline => "offline",
    };
    f.write_str(s)
  }
}

/// Result of one latency probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
  Reachable { latency: Duration },
  Unreachable,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectivitySettings {
  /// Latency above which a reachable probe counts as slow.
  pub slow_threshold: Duration,
  /// Consecutive agreeing probes needed to change state.
  pub corroboration: u32,
}

impl Default for ConnectivitySettings {
  fn default() -> Self {
    Self {
      slow_threshold: Duration::from_millis(2000),
      corroboration: 2,
    }
  }
}

struct MonitorState {
  detected: ConnectivityState,
  forced_offline: bool,
  /// Probe verdict that disagrees with `detected`, and how many times in a row.
  candidate: Option<(ConnectivityState, u32)>,
}

impl MonitorState {
  fn effective(&self) -> ConnectivityState {
    if self.forced_offline {
      ConnectivityState::Offline
    } else {
      self.detected
    }
  }
}

pub struct ConnectivityMonitor {
  store: Arc<dyn KeyValueStore>,
  settings: ConnectivitySettings,
  state: Mutex<MonitorState>,
  tx: watch::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
  /// Create the monitor, restoring the persisted manual override.
  pub async fn load(store: Arc<dyn KeyValueStore>, settings: ConnectivitySettings) -> Self {
    let forced_offline = match store.get(&Namespace::Settings.key(FORCED_OFFLINE_KEY)).await {
      Ok(Some(Value::Bool(forced))) => forced,
      Ok(_) => false,
      Err(e) => {
        warn!(error = %e, "could not read offline override");
        false
      }
    };

    let state = MonitorState {
      detected: ConnectivityState::Online,
      forced_offline,
      candidate: None,
    };
    let (tx, _rx) = watch::channel(state.effective());

    Self {
      store,
      settings,
      state: Mutex::new(state),
      tx,
    }
  }

  /// Effective state, with the manual override applied.
  pub fn current(&self) -> ConnectivityState {
    *self.tx.borrow()
  }

  /// Receiver that observes every effective state change.
  pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
    self.tx.subscribe()
  }

  /// Whether reads are currently served from local data only.
  pub fn is_using_cache(&self) -> bool {
    !self.current().is_online()
  }

  pub fn is_forced_offline(&self) -> bool {
    self.lock().forced_offline
  }

  /// Platform online/offline event. Applied immediately.
  pub fn platform_signal(&self, online: bool) {
    let mut state = self.lock();
    state.candidate = None;
    if !online {
      state.detected = ConnectivityState::Offline;
    } else if state.detected == ConnectivityState::Offline {
      state.detected = ConnectivityState::Online;
    }
    self.publish(&state);
  }

  /// Feed a probe result. Changes state only after corroboration.
  pub fn record_probe(&self, outcome: ProbeOutcome) {
    let verdict = match outcome {
      ProbeOutcome::Unreachable => ConnectivityState::Offline,
      ProbeOutcome::Reachable { latency } if latency > self.settings.slow_threshold => {
        ConnectivityState::OnlineSlow
      }
      ProbeOutcome::Reachable { .. } => ConnectivityState::Online,
    };

    let mut state = self.lock();
    if verdict == state.detected {
      state.candidate = None;
      return;
    }

    let count = match state.candidate {
      Some((candidate, count)) if candidate == verdict => count + 1,
      _ => 1,
    };

    if count >= self.settings.corroboration.max(1) {
      state.detected = verdict;
      state.candidate = None;
      self.publish(&state);
    } else {
      state.candidate = Some((verdict, count));
    }
  }

  /// Toggle the manual offline mode and persist it.
  pub async fn set_forced_offline(&self, forced: bool) -> Durability {
    {
      let mut state = self.lock();
      state.forced_offline = forced;
      self.publish(&state);
    }

    let key = Namespace::Settings.key(FORCED_OFFLINE_KEY);
    match self.store.set(&key, &Value::Bool(forced)).await {
      Ok(()) => Durability::Durable,
      Err(e) => {
        warn!(error = %e, "offline override not persisted");
        Durability::MemoryOnly
      }
    }
  }

  fn publish(&self, state: &MonitorState) {
    let next = state.effective();
    let changed = self.tx.send_if_modified(|current| {
      if *current == next {
        false
      } else {
        *current = next;
        true
      }
    });
    if changed {
      info!(state = %next, "connectivity changed");
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}
