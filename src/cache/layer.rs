//! Cache layer that decides between the status cache and a network read.

use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use super::status::{CachedStatusEntry, StatusCache, StatusKey, VisitStatus};
use super::traits::CacheResult;
use crate::error::RemoteError;

/// Status as reported by the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStatus {
  pub status: VisitStatus,
  pub derived_fields: Map<String, Value>,
}

/// Cache-first reader for tracked statuses.
///
/// Final statuses are served from the cache without a network read. Anything
/// else is fetched, stored, and returned; if the fetch fails the cached entry
/// is served in offline mode.
#[derive(Clone)]
pub struct StatusReader {
  cache: Arc<StatusCache>,
}

impl StatusReader {
  pub fn new(cache: Arc<StatusCache>) -> Self {
    Self { cache }
  }

  pub async fn fetch_status<F, Fut>(
    &self,
    key: &StatusKey,
    fetcher: F,
  ) -> Result<CacheResult<Option<CachedStatusEntry>>, RemoteError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<RemoteStatus>, RemoteError>>,
  {
    let cached = self.cache.get(key);

    if !self.cache.should_refresh_from_network(key) {
      if let Some(entry) = cached {
        debug!(entity = %key.entity_id, "final status served from cache");
        let cached_at = entry.updated_at;
        return Ok(CacheResult::from_cache(Some(entry), cached_at));
      }
    }

    match fetcher().await {
      Ok(Some(remote)) => {
        let entry = self.cache.set(key.clone(), remote.status, remote.derived_fields);
        Ok(CacheResult::from_network(Some(entry)))
      }
      Ok(None) => match cached {
        // Nothing remote yet, the local optimistic value is the latest we know
        Some(entry) => {
          let cached_at = entry.updated_at;
          Ok(CacheResult::from_cache(Some(entry), cached_at))
        }
        None => Ok(CacheResult::from_network(None)),
      },
      Err(e) => match cached {
        Some(entry) => {
          debug!(entity = %key.entity_id, error = %e, "serving cached status offline");
          let cached_at = entry.updated_at;
          Ok(CacheResult::offline(Some(entry), cached_at))
        }
        None => Err(e),
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::clock::{Clock, ManualClock};
  use crate::store::MemoryStore;
  use chrono::{Duration, TimeZone, Utc};
  use std::sync::atomic::{AtomicU32, Ordering};

  async fn reader() -> (StatusReader, Arc<StatusCache>, StatusKey) {
    let clock = Arc::new(ManualClock::new(
      Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap(),
    ));
    let key = StatusKey::new("visit-1", "user-1", clock.today());
    let cache = Arc::new(
      StatusCache::load(Arc::new(MemoryStore::new()), clock, Duration::days(7)).await,
    );
    (StatusReader::new(Arc::clone(&cache)), cache, key)
  }

  fn remote(status: VisitStatus) -> RemoteStatus {
    RemoteStatus {
      status,
      derived_fields: Map::new(),
    }
  }

  #[tokio::test]
  async fn test_final_status_never_calls_fetcher() {
    let (reader, cache, key) = reader().await;
    cache.set(key.clone(), VisitStatus::Productive, Map::new());

    let calls = AtomicU32::new(0);
    let result = reader
      .fetch_status(&key, || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(remote(VisitStatus::Planned)))
      })
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.unwrap().status, VisitStatus::Productive);
  }

  #[tokio::test]
  async fn test_non_final_status_is_refreshed() {
    let (reader, cache, key) = reader().await;
    cache.set(key.clone(), VisitStatus::InProgress, Map::new());

    let result = reader
      .fetch_status(&key, || async { Ok(Some(remote(VisitStatus::Unproductive))) })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert!(!cache.should_refresh_from_network(&key));
  }

  #[tokio::test]
  async fn test_network_failure_serves_cached_offline() {
    let (reader, cache, key) = reader().await;
    cache.set(key.clone(), VisitStatus::InProgress, Map::new());

    let result = reader
      .fetch_status(&key, || async {
        Err(RemoteError::Network("connection reset".to_string()))
      })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert!(result.is_using_cache());
  }

  #[tokio::test]
  async fn test_network_failure_without_cache_is_an_error() {
    let (reader, _cache, key) = reader().await;
    let result = reader
      .fetch_status(&key, || async {
        Err(RemoteError::Network("connection reset".to_string()))
      })
      .await;
    assert!(result.is_err());
  }
}
