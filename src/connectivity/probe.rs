//! Periodic latency probes against the remote store.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

use super::{ConnectivityMonitor, ProbeOutcome};

#[async_trait]
pub trait Prober: Send + Sync {
  async fn probe(&self) -> ProbeOutcome;
}

/// Probes by timing a GET on a health URL.
///
/// Any HTTP response counts as reachable; only transport failures and the
/// timeout count as unreachable.
pub struct HttpProber {
  client: Client,
  url: Url,
  api_key: Option<String>,
}

impl HttpProber {
  pub fn new(url: Url, api_key: Option<String>, timeout: Duration) -> Result<Self> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create probe client: {}", e))?;
    Ok(Self {
      client,
      url,
      api_key,
    })
  }
}

#[async_trait]
impl Prober for HttpProber {
  async fn probe(&self) -> ProbeOutcome {
    let mut request = self.client.get(self.url.clone());
    if let Some(key) = &self.api_key {
      request = request.header("apikey", key);
    }

    let started = Instant::now();
    match request.send().await {
      Ok(_) => ProbeOutcome::Reachable {
        latency: started.elapsed(),
      },
      Err(e) => {
        debug!(error = %e, "probe failed");
        ProbeOutcome::Unreachable
      }
    }
  }
}

/// Run `prober` every `every` and feed the results to `monitor`.
pub fn spawn_probe_loop(
  monitor: Arc<ConnectivityMonitor>,
  prober: Arc<dyn Prober>,
  every: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      let outcome = prober.probe().await;
      monitor.record_probe(outcome);
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::{ConnectivitySettings, ConnectivityState};
  use crate::store::MemoryStore;

  struct Down;

  #[async_trait]
  impl Prober for Down {
    async fn probe(&self) -> ProbeOutcome {
      ProbeOutcome::Unreachable
    }
  }

  #[tokio::test]
  async fn test_probe_loop_feeds_monitor() {
    let monitor = Arc::new(
      ConnectivityMonitor::load(Arc::new(MemoryStore::new()), ConnectivitySettings::default())
        .await,
    );

    let handle = spawn_probe_loop(Arc::clone(&monitor), Arc::new(Down), Duration::from_millis(5));
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.abort();

    assert_eq!(monitor.current(), ConnectivityState::Offline);
  }
}
