use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sitewatch::alerting::EvaluationService;
use sitewatch::db::{
    AlertInvocationStore, AlertStore, MemoryStore, MonitorStore, PgStore, StatusStore,
};
use sitewatch::notifications::NotificationService;
use sitewatch::probe::HttpProbeExecutor;
use sitewatch::scheduler::Scheduler;
use sitewatch::server::{AppConfig, LocalCheckRunner, RetentionTask};

const VERSION: &str = env!("CARGO_PKG_VERSION");

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tick every minute until interrupted (default)
    Run,
    /// Run a single tick, e.g. when driven by an external orchestrator
    Tick {
        /// RFC 3339 tick time; defaults to now
        #[arg(long)]
        at: Option<String>,
    },
    /// Run one status retention pass
    Prune,
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "scheduler.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    // Default to `info,sqlx::query=warn` if RUST_LOG is not set.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx::query=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

struct Stores {
    monitors: Arc<dyn MonitorStore>,
    statuses: Arc<dyn StatusStore>,
    alerts: Arc<dyn AlertStore>,
    invocations: Arc<dyn AlertInvocationStore>,
}

impl Stores {
    fn shared<S>(store: Arc<S>) -> Self
    where
        S: MonitorStore + StatusStore + AlertStore + AlertInvocationStore + 'static,
    {
        Self {
            monitors: store.clone(),
            statuses: store.clone(),
            alerts: store.clone(),
            invocations: store,
        }
    }
}

async fn open_stores(config: &AppConfig) -> Result<Stores, BoxError> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url, config.database_max_connections, config.channel_cipher()?).await?;
            store.migrate().await?;
            info!("Connected to PostgreSQL.");
            Ok(Stores::shared(Arc::new(store)))
        }
        None => {
            warn!("DATABASE_URL not set; using the in-memory store. Nothing will persist.");
            Ok(Stores::shared(Arc::new(MemoryStore::new())))
        }
    }
}

fn parse_tick(at: Option<&str>) -> Result<DateTime<Utc>, BoxError> {
    match at {
        Some(raw) => Ok(DateTime::parse_from_rfc3339(raw)
            .map_err(|e| format!("Invalid --at value '{raw}': {e}"))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    let config = match AppConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&config.log_dir);
    info!(version = VERSION, region = %config.region, "Starting scheduler.");

    let stores = open_stores(&config).await?;
    let retry = config.retry_policy();

    let retention = Arc::new(RetentionTask::new(
        stores.statuses.clone(),
        config.status_retention(),
        retry.clone(),
    ));

    if let Some(Command::Prune) = args.command {
        let removed = retention.prune_once(Utc::now()).await?;
        info!(removed, "Retention pass finished.");
        return Ok(());
    }

    let notifier = Arc::new(NotificationService::new(config.smtp_settings()));
    let evaluator = Arc::new(
        EvaluationService::new(
            stores.alerts.clone(),
            stores.invocations.clone(),
            stores.statuses.clone(),
            notifier,
            retry.clone(),
        )
        .with_monitor_store(stores.monitors.clone()),
    );
    let executor = Arc::new(HttpProbeExecutor::new(config.probe_timeout())?);
    let runner = Arc::new(LocalCheckRunner::new(
        executor,
        stores.statuses.clone(),
        evaluator,
        retry.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        stores.monitors.clone(),
        runner.clone(),
        config.region.clone(),
        retry,
        config.tick_period(),
    ));

    match args.command {
        Some(Command::Tick { at }) => {
            let tick = parse_tick(at.as_deref())?;
            let report = scheduler.run_tick(tick).await?;
            runner.drain().await;
            info!(tick = %report.tick, due = report.due, failed = report.failed, "Single tick finished.");
        }
        _ => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let shutdown = |mut rx: watch::Receiver<bool>| async move {
                let _ = rx.changed().await;
            };

            let scheduler_handle = tokio::spawn(scheduler.run(shutdown(shutdown_rx.clone())));
            let retention_handle = tokio::spawn(
                retention.run_periodic(config.retention_interval(), shutdown(shutdown_rx)),
            );

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received.");
            let _ = shutdown_tx.send(true);

            for (name, handle) in [("scheduler", scheduler_handle), ("retention", retention_handle)] {
                if let Err(e) = handle.await {
                    error!(task = name, error = %e, "Background task ended abnormally.");
                }
            }
            runner.drain().await;
            info!("Scheduler stopped.");
        }
    }

    Ok(())
}
