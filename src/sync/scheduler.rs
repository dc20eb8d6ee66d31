//! Decides when the sync engine drains.
//!
//! Drains happen when connectivity comes back, when the app returns to the
//! foreground, on explicit request, and on a timer while the app is in the
//! foreground and online. The timer is paused entirely in the background.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::engine::{SyncEngine, SyncReport};
use crate::connectivity::ConnectivityMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  Foreground,
  Background,
}

#[derive(Debug)]
enum Command {
  Lifecycle(Lifecycle),
  TriggerNow,
  Shutdown,
}

/// Handle to a running scheduler task.
pub struct SchedulerHandle {
  tx: mpsc::UnboundedSender<Command>,
  reports: mpsc::UnboundedReceiver<SyncReport>,
  task: JoinHandle<()>,
}

impl SchedulerHandle {
  pub fn foreground(&self) {
    let _ = self.tx.send(Command::Lifecycle(Lifecycle::Foreground));
  }

  pub fn background(&self) {
    let _ = self.tx.send(Command::Lifecycle(Lifecycle::Background));
  }

  /// Ask for a drain now (ignored while offline).
  pub fn trigger_now(&self) {
    let _ = self.tx.send(Command::TriggerNow);
  }

  /// Next report from a drain that did some work.
  pub async fn next_report(&mut self) -> Option<SyncReport> {
    self.reports.recv().await
  }

  pub async fn shutdown(self) {
    let _ = self.tx.send(Command::Shutdown);
    let _ = self.task.await;
  }
}

/// Spawn the scheduler loop.
pub fn spawn_scheduler(
  engine: Arc<SyncEngine>,
  connectivity: Arc<ConnectivityMonitor>,
  interval: Duration,
) -> SchedulerHandle {
  let (tx, mut rx) = mpsc::unbounded_channel();
  let (report_tx, reports) = mpsc::unbounded_channel();

  let task = tokio::spawn(async move {
    let mut states = connectivity.subscribe();
    let mut foreground = true;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let drain = |reason: &'static str| {
      let engine = Arc::clone(&engine);
      let connectivity = Arc::clone(&connectivity);
      let report_tx = report_tx.clone();
      async move {
        if !connectivity.current().is_online() {
          debug!(reason, "offline, not draining");
          return;
        }
        if engine.queue().is_empty() {
          return;
        }
        debug!(reason, "draining sync queue");
        let report = engine.drain().await;
        if !report.coalesced {
          let _ = report_tx.send(report);
        }
      }
    };

    loop {
      tokio::select! {
        changed = states.changed() => {
          if changed.is_err() {
            break;
          }
          let state = *states.borrow_and_update();
          if state.is_online() && foreground {
            drain("connectivity").await;
          }
        }
        command = rx.recv() => match command {
          None | Some(Command::Shutdown) => break,
          Some(Command::Lifecycle(Lifecycle::Foreground)) => {
            foreground = true;
            ticker.reset();
            drain("foreground").await;
          }
          Some(Command::Lifecycle(Lifecycle::Background)) => {
            foreground = false;
          }
          Some(Command::TriggerNow) => drain("manual").await,
        },
        _ = ticker.tick(), if foreground => {
          drain("timer").await;
        }
      }
    }

    info!("sync scheduler stopped");
  });

  SchedulerHandle { tx, reports, task }
}
