use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use revalsync::cache::{CacheLayer, NoopStorage, SqliteStorage};
use revalsync::config::Config;
use revalsync::db::Database;
use revalsync::net::{ApiClient, ConnectivityProbe, HttpProbe, ProbeMonitor};
use revalsync::policy::{AccessPolicy, SubscriptionStatus, Tier};
use revalsync::queue::{MutationMethod, OperationQueue};
use revalsync::session::Session;
use revalsync::sync::SyncConfig;
use revalsync::{
  DrainOutcome, Gateway, MutationOutcome, PolicyHandle, SubscriptionPolicy, SyncCoordinator,
};

#[derive(Parser, Debug)]
#[command(name = "revalsync")]
#[command(about = "Offline-first access to the revalidation evidence API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/revalsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Subscription tier to assume until a profile response says otherwise
  #[arg(long, value_enum, default_value_t = TierArg::Free)]
  tier: TierArg,

  /// Subscription status to assume
  #[arg(long, value_enum, default_value_t = StatusArg::Active)]
  status: StatusArg,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read an endpoint
  Get { endpoint: String },
  /// Send a POST, PUT, PATCH or DELETE
  Mutate {
    method: MutationMethod,
    endpoint: String,
    /// JSON request body
    #[arg(short, long)]
    body: Option<String>,
  },
  /// Run one drain pass over the offline queue
  Sync,
  /// Show connectivity, subscription and queue state
  Status,
  /// Keep probing connectivity and sync whenever it returns (Ctrl-C to stop)
  Watch,
  /// Clear the response cache and drop every queued operation
  Reset,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TierArg {
  Free,
  Premium,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StatusArg {
  Active,
  Trial,
  Expired,
  Cancelled,
}

impl From<TierArg> for Tier {
  fn from(arg: TierArg) -> Self {
    match arg {
      TierArg::Free => Tier::Free,
      TierArg::Premium => Tier::Premium,
    }
  }
}

impl From<StatusArg> for SubscriptionStatus {
  fn from(arg: StatusArg) -> Self {
    match arg {
      StatusArg::Active => SubscriptionStatus::Active,
      StatusArg::Trial => SubscriptionStatus::Trial,
      StatusArg::Expired => SubscriptionStatus::Expired,
      StatusArg::Cancelled => SubscriptionStatus::Cancelled,
    }
  }
}

/// Components wired together once per process.
struct App {
  config: Config,
  gateway: Gateway,
  coordinator: Arc<SyncCoordinator>,
  probe: Arc<HttpProbe>,
}

impl App {
  fn new(config: Config, subscription: SubscriptionPolicy) -> Result<Self> {
    let db = match &config.storage.path {
      Some(path) => Database::open(path)?,
      None => Database::open_default()?,
    };

    let cache = if config.cache.enabled {
      CacheLayer::new(SqliteStorage::new(db.clone()))
    } else {
      CacheLayer::new(NoopStorage)
    };
    let queue = OperationQueue::open(db)?;

    let transport = Arc::new(ApiClient::new(&config.api.url, config.request_timeout())?);
    let probe = Arc::new(HttpProbe::new(config.check_url(), config.probe_timeout())?);

    let gateway = Gateway::new(
      transport,
      probe.clone(),
      cache,
      queue,
      PolicyHandle::new(subscription),
      Session::new(Config::get_api_token()),
    )
    .with_access_policy(AccessPolicy::new(&config.policy.mandatory_prefixes))
    .with_profile_endpoint(&config.api.profile_endpoint);

    let coordinator = Arc::new(SyncCoordinator::new(
      gateway.clone(),
      SyncConfig::from(&config.sync),
    ));

    Ok(Self {
      config,
      gateway,
      coordinator,
      probe,
    })
  }

  async fn get(&self, endpoint: &str) -> Result<()> {
    let mut refreshes = self.gateway.refresh_events();
    let result = self.gateway.get(endpoint).await?;

    println!("{}", String::from_utf8_lossy(&result.data));
    if let Some(cached_at) = result.cached_at {
      eprintln!("(from cache, stored {})", cached_at.to_rfc3339());
      // Let the background refresh land before the process exits
      let _ = tokio::time::timeout(self.config.request_timeout(), refreshes.recv()).await;
    }
    Ok(())
  }

  async fn mutate(&self, method: MutationMethod, endpoint: &str, body: Option<&str>) -> Result<()> {
    let body = match body {
      Some(raw) => {
        serde_json::from_str::<serde_json::Value>(raw)
          .map_err(|e| eyre!("Request body is not valid JSON: {}", e))?;
        Some(raw.as_bytes().to_vec())
      }
      None => None,
    };

    let outcome = self.gateway.mutate(method, endpoint, body).await?;
    println!("{}", String::from_utf8_lossy(&outcome.body()));
    if let MutationOutcome::Queued { op_id } = outcome {
      eprintln!("Offline: queued as operation {} for later sync", op_id);
    }
    Ok(())
  }

  async fn sync(&self) -> Result<()> {
    match self.coordinator.drain().await? {
      DrainOutcome::Completed(summary) => {
        println!("{}", summary);
        for failed in &summary.failed {
          println!("  failed: {} {} ({})", failed.method, failed.endpoint, failed.reason);
        }
      }
      DrainOutcome::Offline => println!("Offline, nothing synced"),
      DrainOutcome::AlreadyRunning => println!("A sync is already running"),
    }
    Ok(())
  }

  async fn status(&self) -> Result<()> {
    let online = self.probe.is_online().await;
    let subscription = self.gateway.policy().snapshot();

    println!("connectivity: {}", if online { "online" } else { "offline" });
    println!(
      "subscription: {:?} ({:?}), offline access: {}",
      subscription.tier,
      subscription.status,
      if subscription.can_use_offline { "yes" } else { "no" }
    );
    println!("changes waiting to sync: {}", self.coordinator.pending_count()?);
    println!("cached endpoints: {}", self.gateway.cache().len());
    Ok(())
  }

  async fn watch(&self) -> Result<()> {
    let mut summaries = self.coordinator.summaries();
    let _auto_sync = self.coordinator.spawn_auto_sync();
    let monitor = ProbeMonitor::spawn(self.probe.clone(), self.config.poll_interval());
    info!(interval = ?self.config.poll_interval(), "watching connectivity");
    eprintln!("Watching connectivity, Ctrl-C to stop");

    loop {
      tokio::select! {
        _ = tokio::signal::ctrl_c() => break,
        summary = summaries.recv() => {
          if let Ok(summary) = summary {
            println!("{}", summary);
          }
        }
      }
    }

    monitor.shutdown();
    Ok(())
  }

  fn reset(&self) -> Result<()> {
    self.gateway.cache().clear_all();
    let dropped = self.gateway.queue().clear_all()?;
    println!("Cache cleared, {} queued operations dropped", dropped);
    Ok(())
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Keep the guard alive so buffered log lines are flushed on exit
  let _log_guard = revalsync::logging::init(&config.log_dir()?)?;
  let subscription = SubscriptionPolicy::new(args.tier.into(), args.status.into());

  let app = App::new(config, subscription)?;

  match args.command {
    Command::Get { endpoint } => app.get(&endpoint).await?,
    Command::Mutate {
      method,
      endpoint,
      body,
    } => app.mutate(method, &endpoint, body.as_deref()).await?,
    Command::Sync => app.sync().await?,
    Command::Status => app.status().await?,
    Command::Watch => app.watch().await?,
    Command::Reset => app.reset()?,
  }

  Ok(())
}
