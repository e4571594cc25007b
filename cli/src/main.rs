//! Warden backend daemon.
//!
//! Wires the persistence core, capability broker, notification worker,
//! postponement manager, and observability collector together, then runs
//! until interrupted. The chat transport and the LLM agent client are
//! injected collaborators; without them the daemon logs outbound
//! notifications instead of delivering them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tracing::info;
use tracing::warn;

use warden_broker::BrokerRouter;
use warden_broker::ScopeValidator;
use warden_config::ConfigManager;
use warden_config::install_config_manager;
use warden_observability::SnapshotCollector;
use warden_observability::StatusCache;
use warden_persistence::AuditStore;
use warden_persistence::DbManager;
use warden_persistence::OutboxStore;
use warden_persistence::PostponementStore;
use warden_persistence::install_db_manager;
use warden_persistence::run_migrations;
use warden_runtime::ChatTransport;
use warden_runtime::NotificationWorker;
use warden_runtime::PostponementManager;

/// Warden: capability broker backend for a personal AI assistant.
#[derive(Debug, Parser)]
#[clap(name = "warden", version, bin_name = "warden")]
struct Cli {
    /// Path to the TOML configuration file.
    #[clap(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    subcommand: Option<Subcommand>,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Apply pending database migrations and exit.
    Migrate,
}

/// Stand-in transport used when no chat client is wired in: marks every
/// notification delivered after logging it.
struct LoggingTransport;

#[async_trait]
impl ChatTransport for LoggingTransport {
    async fn send_message(&self, chat_id: i64, text: &str) -> bool {
        info!(chat_id, text, "notification (no chat transport configured)");
        true
    }
}

fn init_logging(config: &ConfigManager) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let log_path = PathBuf::from(config.string("logging.file_path"));
    let log_dir = log_path
        .parent()
        .map(std::path::Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let file_name = log_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "warden.log".to_string());

    let file_appender = tracing_appender::rolling::never(&log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.string("logging.level")));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Arc::new(ConfigManager::load(cli.config.clone()).context("configuration load failed")?);
    let _log_guard = init_logging(&config)?;

    let db_path = PathBuf::from(config.string("database.path"));
    let migrations_dir = PathBuf::from(config.string("database.migrations_dir"));

    if matches!(cli.subcommand, Some(Subcommand::Migrate)) {
        let report = run_migrations(&db_path, &migrations_dir).context("migration run failed")?;
        println!(
            "migrations: {} applied, {} verified",
            report.applied.len(),
            report.verified
        );
        return Ok(());
    }

    // Migrations run before anything touches the connection.
    let report = run_migrations(&db_path, &migrations_dir).context("migration run failed")?;
    info!(
        applied = report.applied.len(),
        verified = report.verified,
        "database migrations up to date"
    );

    let db = Arc::new(DbManager::new(&db_path));
    install_db_manager(Arc::clone(&db));
    install_config_manager(Arc::clone(&config));

    let audit = AuditStore::new(Arc::clone(&db));
    let outbox = OutboxStore::new(Arc::clone(&db));
    let postponements = PostponementStore::new(Arc::clone(&db));

    // The agent-side integration routes every tool call through this broker;
    // nothing else may touch the capability layer.
    let scope = ScopeValidator::new(&config.list("scope.allowed_roots"));
    let _broker = Arc::new(BrokerRouter::new(
        scope,
        Arc::clone(&config),
        audit.clone(),
        outbox.clone(),
    ));

    let transport: Arc<dyn ChatTransport> = Arc::new(LoggingTransport);
    let worker = Arc::new(NotificationWorker::new(
        transport,
        outbox.clone(),
        Arc::clone(&config),
    ));
    worker.start();

    let postponement_manager = PostponementManager::new(
        postponements,
        outbox.clone(),
        audit.clone(),
        Arc::clone(&config),
    );
    postponement_manager.recover_pending();

    let status_cache = Arc::new(StatusCache::new());
    let collector = SnapshotCollector::new(
        Arc::clone(&config),
        Arc::clone(&db),
        audit,
        outbox,
        Arc::clone(&status_cache),
    );
    let collector_handle = collector.spawn();

    info!("warden ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    collector_handle.abort();
    worker.stop().await;
    db.close();

    if let Some(snapshot) = status_cache.get() {
        info!(
            uptime_seconds = snapshot.process.uptime_seconds,
            "final status snapshot recorded"
        );
    } else {
        warn!("no status snapshot was collected this run");
    }

    info!("warden stopped");
    Ok(())
}
