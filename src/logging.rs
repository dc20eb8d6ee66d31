use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "fieldsync=info";

/// Default log directory ($XDG_DATA_HOME/fieldsync/logs).
pub fn default_log_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir().ok_or_else(|| eyre!("Could not determine data directory"))?;
  Ok(data_dir.join("fieldsync").join("logs"))
}

/// Install the global subscriber: a daily-rolling file in `log_dir`, plus
/// stderr when `verbose` is set.
///
/// Keep the returned guard alive for the life of the process or buffered
/// lines are lost on exit.
pub fn init(log_dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, "fieldsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  // RUST_LOG overrides the default
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

  let stderr = verbose.then(|| fmt::layer().with_writer(std::io::stderr).boxed());

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(stderr)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}
