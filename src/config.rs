use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::connectivity::ConnectivitySettings;
use crate::offline::OfflineSettings;
use crate::sync::{Backoff, SyncSettings};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the REST endpoint, e.g. https://project.example.co
  pub url: String,
  /// Path probed for latency (relative to `url`)
  #[serde(default = "default_health_path")]
  pub health_path: String,
}

fn default_health_path() -> String {
  "/rest/v1/".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub interval_secs: u64,
  pub request_timeout_secs: u64,
  pub bulk_timeout_secs: u64,
  pub backoff_base_secs: u64,
  pub backoff_cap_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: 60,
      request_timeout_secs: 15,
      bulk_timeout_secs: 30,
      backoff_base_secs: 2,
      backoff_cap_secs: 300,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_interval_secs: u64,
  /// Probe latency above this counts as a slow connection
  pub slow_threshold_ms: u64,
  /// Consecutive agreeing probes needed to change state
  pub corroboration: u32,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 30,
      slow_threshold_ms: 2000,
      corroboration: 2,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub retention_days: i64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      retention_days: crate::cache::DEFAULT_RETENTION_DAYS,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// SQLite file (defaults to $XDG_DATA_HOME/fieldsync/store.db)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/fieldsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.remote_url()?;
    Ok(config)
  }

  /// Get the remote API key from the environment.
  ///
  /// Checks FIELDSYNC_API_KEY.
  pub fn get_api_key() -> Result<String> {
    std::env::var("FIELDSYNC_API_KEY")
      .map_err(|_| eyre!("Remote API key not found. Set FIELDSYNC_API_KEY environment variable."))
  }

  pub fn remote_url(&self) -> Result<Url> {
    Url::parse(&self.remote.url).map_err(|e| eyre!("Invalid remote.url {}: {}", self.remote.url, e))
  }

  pub fn health_url(&self) -> Result<Url> {
    self
      .remote_url()?
      .join(&self.remote.health_path)
      .map_err(|e| eyre!("Invalid remote.health_path {}: {}", self.remote.health_path, e))
  }

  pub fn sync_interval(&self) -> Duration {
    Duration::from_secs(self.sync.interval_secs.max(1))
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.connectivity.probe_interval_secs.max(1))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.sync.request_timeout_secs)
  }

  pub fn offline_settings(&self) -> OfflineSettings {
    OfflineSettings {
      retention: chrono::Duration::days(self.cache.retention_days),
      connectivity: ConnectivitySettings {
        slow_threshold: Duration::from_millis(self.connectivity.slow_threshold_ms),
        corroboration: self.connectivity.corroboration,
      },
      sync: SyncSettings {
        request_timeout: Duration::from_secs(self.sync.request_timeout_secs),
        bulk_timeout: Duration::from_secs(self.sync.bulk_timeout_secs),
        backoff: Backoff {
          base: Duration::from_secs(self.sync.backoff_base_secs),
          cap: Duration::from_secs(self.sync.backoff_cap_secs),
        },
      },
    }
  }
}
