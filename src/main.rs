use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use fieldsync::clock::SystemClock;
use fieldsync::config::Config;
use fieldsync::connectivity::{spawn_probe_loop, ConnectivityMonitor, HttpProber, Prober, ProbeOutcome};
use fieldsync::queue::SyncQueue;
use fieldsync::remote::RestRemoteStore;
use fieldsync::store::{KeyValueStore, SqliteStore};
use fieldsync::sync::spawn_scheduler;
use fieldsync::{logging, OfflineContext};

const DAY_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first cache and sync queue for field-sales data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Probe connectivity and drain the queue until Ctrl-C
  Run,
  /// List queued operations
  Pending,
  /// Show connectivity and the pending-sync summary
  Status,
  /// Drop every queued operation (unsynced writes are lost)
  Clear {
    /// Confirm the wipe
    #[arg(long)]
    yes: bool,
  },
  /// Reset a rejected operation so the next drain tries it again
  Retry { id: Uuid },
  /// Force offline mode on or off
  Offline { mode: Toggle },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Toggle {
  On,
  Off,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;

  let _log_guard = logging::init(&logging::default_log_dir()?, args.verbose)?;

  let store: Arc<dyn KeyValueStore> = Arc::new(match &config.storage.path {
    Some(path) => SqliteStore::open(path)?,
    None => SqliteStore::open_default()?,
  });

  match args.command {
    Command::Run => run(config, store).await,
    Command::Pending => pending(store).await,
    Command::Status => status(&config, store).await,
    Command::Clear { yes } => clear(store, yes).await,
    Command::Retry { id } => retry(store, id).await,
    Command::Offline { mode } => offline(&config, store, mode).await,
  }
}

async fn run(config: Config, store: Arc<dyn KeyValueStore>) -> Result<()> {
  let api_key = Config::get_api_key()?;
  let remote = RestRemoteStore::new(config.remote_url()?, api_key.clone(), config.request_timeout())?;
  let prober = HttpProber::new(config.health_url()?, Some(api_key), config.request_timeout())?;

  let ctx = OfflineContext::open(
    store,
    Arc::new(remote),
    Arc::new(SystemClock),
    config.offline_settings(),
  )
  .await;
  ctx.roll_day_if_needed().await;

  let probes = spawn_probe_loop(
    Arc::clone(ctx.connectivity()),
    Arc::new(prober),
    config.probe_interval(),
  );
  let mut scheduler = spawn_scheduler(
    Arc::clone(ctx.engine()),
    Arc::clone(ctx.connectivity()),
    config.sync_interval(),
  );
  let mut day_check = tokio::time::interval(DAY_CHECK_INTERVAL);

  info!(pending = ctx.queue().len(), "fieldsync running");
  println!("Running. {} operation(s) pending. Press Ctrl-C to stop.", ctx.queue().len());

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      Some(report) = scheduler.next_report() => {
        println!(
          "Synced {}, retrying {}, rejected {}, waiting {}",
          report.synced.len(),
          report.retried.len(),
          report.rejected.len(),
          report.skipped.len(),
        );
        for rejection in &report.rejected {
          println!(
            "  {} {} {}: {}",
            rejection.op_id, rejection.entity_type.table(), rejection.target_key, rejection.error
          );
        }
      }
      _ = day_check.tick() => {
        ctx.roll_day_if_needed().await;
      }
    }
  }

  probes.abort();
  scheduler.shutdown().await;
  ctx.flush().await;
  info!("fieldsync stopped");
  Ok(())
}

async fn pending(store: Arc<dyn KeyValueStore>) -> Result<()> {
  let queue = SyncQueue::load(store, Arc::new(SystemClock)).await;
  let ops = queue.peek_all();

  if ops.is_empty() {
    println!("Nothing pending.");
    return Ok(());
  }

  for op in ops {
    println!(
      "{}  {:<11} {:<6} {:<36} {:?} attempts={}{}",
      op.id,
      op.entity_type.table(),
      format!("{:?}", op.kind).to_lowercase(),
      op.target_key,
      op.status,
      op.attempts,
      op.last_error
        .as_ref()
        .map(|e| format!(" last_error={}", e))
        .unwrap_or_default(),
    );
  }
  if queue.unreadable_entries() > 0 {
    println!("{} stored entries could not be read.", queue.unreadable_entries());
  }
  Ok(())
}

async fn status(config: &Config, store: Arc<dyn KeyValueStore>) -> Result<()> {
  let settings = config.offline_settings();
  let queue = SyncQueue::load(Arc::clone(&store), Arc::new(SystemClock)).await;
  let monitor = ConnectivityMonitor::load(store, settings.connectivity).await;

  let api_key = Config::get_api_key().ok();
  let prober = HttpProber::new(config.health_url()?, api_key, config.request_timeout())?;
  let reachability = match prober.probe().await {
    ProbeOutcome::Reachable { latency } if latency > settings.connectivity.slow_threshold => {
      format!("reachable (slow, {} ms)", latency.as_millis())
    }
    ProbeOutcome::Reachable { latency } => format!("reachable ({} ms)", latency.as_millis()),
    ProbeOutcome::Unreachable => "unreachable".to_string(),
  };

  let summary = queue.pending_summary();
  println!("Remote:       {}", reachability);
  println!(
    "Offline mode: {}",
    if monitor.is_forced_offline() { "forced on" } else { "automatic" }
  );
  println!(
    "Pending sync: {} ({} retrying, {} need attention)",
    summary.total, summary.retrying, summary.needs_attention
  );
  Ok(())
}

async fn clear(store: Arc<dyn KeyValueStore>, yes: bool) -> Result<()> {
  let queue = SyncQueue::load(store, Arc::new(SystemClock)).await;
  if !yes {
    return Err(eyre!(
      "Refusing to drop {} unsynced operation(s) without --yes",
      queue.len()
    ));
  }

  let removed = queue
    .clear()
    .await
    .map_err(|e| eyre!("Failed to clear sync queue: {}", e))?;
  println!("Cleared {} pending operation(s).", removed);
  Ok(())
}

async fn retry(store: Arc<dyn KeyValueStore>, id: Uuid) -> Result<()> {
  let queue = SyncQueue::load(store, Arc::new(SystemClock)).await;
  if queue.retry(id).await {
    println!("Operation {} will be retried on the next sync.", id);
    Ok(())
  } else {
    Err(eyre!("No rejected operation with id {}", id))
  }
}

async fn offline(config: &Config, store: Arc<dyn KeyValueStore>, mode: Toggle) -> Result<()> {
  let monitor = ConnectivityMonitor::load(store, config.offline_settings().connectivity).await;
  let forced = matches!(mode, Toggle::On);
  let durability = monitor.set_forced_offline(forced).await;
  println!(
    "Offline mode {} ({:?}).",
    if forced { "forced on" } else { "off" },
    durability
  );
  Ok(())
}
