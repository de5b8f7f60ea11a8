//! Warden - configuration integrity monitor
//!
//! Subcommands:
//! - `run`: watch the configured entries, roll back critical drift and alert;
//!   operator commands (`allow`, `critical`, `noncritical`, `status`) are read
//!   from stdin
//! - `history`: query the persisted change history
//! - `counts`: per-day change counts for the last N days
//! - `entries`: validate and list the configured entries

mod control;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::control::ControlCommand;
use warden_channels::dispatcher::{routes_from_config, AlertDispatcher};
use warden_core::{Monitor, MonitorConfig, MonitorDeps};
use warden_store::{JsonFileStore, MemoryAuditLog, SqliteAuditLog};
use warden_types::config::WardenConfig;
use warden_types::config_loader::ConfigLoader;
use warden_types::entry_source::{EntryWatcher, FileEntrySource};
use warden_types::model::{ChangeFilter, EntryKey, LogLevel, MonitorEvent};
use warden_types::traits::{AuditLog, EntrySource};

/// Warden CLI
#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Configuration integrity monitor with rollback and alerting", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory containing warden.yaml
    #[arg(short, long, env = "WARDEN_CONFIG_DIR", default_value = ".")]
    config_dir: PathBuf,

    /// Log level, overridden by RUST_LOG
    #[arg(long, env = "WARDEN_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitor until interrupted
    Run,

    /// Show recorded changes, newest first
    History {
        /// Only this entry, as `locator::value_name`
        #[arg(long)]
        key: Option<String>,

        /// Only changes at or after this RFC 3339 timestamp
        #[arg(long, value_parser = parse_timestamp)]
        since: Option<DateTime<Utc>>,

        /// Only changes at or before this RFC 3339 timestamp
        #[arg(long, value_parser = parse_timestamp)]
        until: Option<DateTime<Utc>>,

        /// Only changes not yet approved
        #[arg(long)]
        unacknowledged: bool,

        /// Only changes to critical entries
        #[arg(long)]
        critical: bool,

        /// Maximum number of records
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show per-day change counts
    Counts {
        /// Number of days, including today
        #[arg(long, default_value_t = 7)]
        days: u32,
    },

    /// Validate and list the configured entries
    Entries,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Command::Run => run(&cli.config_dir).await,
        Command::History {
            key,
            since,
            until,
            unacknowledged,
            critical,
            limit,
        } => {
            let key = match key {
                Some(text) => Some(
                    EntryKey::parse(&text)
                        .with_context(|| format!("invalid key '{text}', expected locator::value_name"))?,
                ),
                None => None,
            };
            let filter = ChangeFilter {
                key,
                since,
                until,
                acknowledged: unacknowledged.then_some(false),
                critical: critical.then_some(true),
                limit: Some(limit),
            };
            history(&cli.config_dir, &filter).await
        }
        Command::Counts { days } => counts(&cli.config_dir, days).await,
        Command::Entries => entries(&cli.config_dir),
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid RFC 3339 timestamp: {e}"))
}

// ============================================================
// run
// ============================================================

async fn run(config_dir: &Path) -> anyhow::Result<()> {
    let (mut loader, mut config_rx) = ConfigLoader::load(config_dir)?;
    loader.watch()?;
    let config = config_rx.borrow_and_update().clone();

    let entries_path = loader.resolve(&config.entries_file);
    let audit = open_audit(&loader, &config).await?;
    let dispatcher = Arc::new(AlertDispatcher::from_config(&config.alerts, &config.channels)?);

    let monitor = Monitor::spawn(
        MonitorDeps {
            store: Arc::new(JsonFileStore::with_base_dir(loader.config_dir())),
            audit,
            dispatcher: dispatcher.clone(),
            source: Arc::new(FileEntrySource::new(&entries_path)),
        },
        MonitorConfig::from(&config),
    );
    let mut events = monitor.subscribe();
    let (_entry_watcher, mut entries_rx) = EntryWatcher::start(&entries_path)?;

    monitor.start().await?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_dir = %config_dir.display(),
        "warden running"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut control = BufReader::new(tokio::io::stdin()).lines();
    let mut control_open = true;

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for shutdown signal");
                }
                info!("shutdown requested");
                break;
            }
            changed = entries_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                match monitor.reload().await {
                    Ok(count) => info!(count, "entry file changed, entries reloaded"),
                    Err(e) => warn!(error = %e, "entry file changed but reload failed, keeping previous entries"),
                }
            }
            changed = config_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = config_rx.borrow_and_update().clone();
                apply_config(&monitor, &dispatcher, &config, &next).await?;
            }
            line = control.next_line(), if control_open => match line {
                Ok(Some(line)) => handle_control(&monitor, &line).await,
                Ok(None) => {
                    info!("stdin closed, operator commands disabled");
                    control_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read stdin, operator commands disabled");
                    control_open = false;
                }
            },
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log lagging behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    monitor.shutdown().await?;
    info!("warden stopped");
    Ok(())
}

async fn open_audit(loader: &ConfigLoader, config: &WardenConfig) -> anyhow::Result<Arc<dyn AuditLog>> {
    let audit: Arc<dyn AuditLog> = match &config.audit_database {
        Some(path) => Arc::new(SqliteAuditLog::open(&loader.resolve(path)).await?),
        None => {
            warn!("no audit_database configured, change history is kept in memory only");
            Arc::new(MemoryAuditLog::new())
        }
    };
    Ok(audit)
}

/// Push a hot-reloaded config into the running dispatcher and monitor.
async fn apply_config(
    monitor: &Monitor,
    dispatcher: &AlertDispatcher,
    initial: &WardenConfig,
    next: &WardenConfig,
) -> anyhow::Result<()> {
    match routes_from_config(&next.channels) {
        Ok(routes) => dispatcher.set_routes(routes).await,
        Err(e) => warn!(error = %e, "invalid channel configuration, keeping previous channels"),
    }
    monitor.reconfigure(MonitorConfig::from(next)).await?;

    if next.entries_file != initial.entries_file || next.audit_database != initial.audit_database {
        warn!("entries_file and audit_database changes take effect after a restart");
    }
    info!("configuration applied");
    Ok(())
}

async fn handle_control(monitor: &Monitor, line: &str) {
    let command = match ControlCommand::parse(line) {
        Ok(Some(command)) => command,
        Ok(None) => return,
        Err(e) => {
            warn!("{e}");
            return;
        }
    };
    if let Err(e) = command.apply(monitor).await {
        warn!(?command, error = %e, "operator command failed");
    }
}

fn log_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::CriticalChangeDetected { key, message } => warn!(key = %key, "{message}"),
        MonitorEvent::RollbackPerformed { key, restored_value } => {
            info!(key = %key, value = %restored_value, "rollback performed")
        }
        MonitorEvent::ChangeAcknowledged { key, records } => {
            info!(key = %key, records, "change acknowledged")
        }
        MonitorEvent::Log { level, message } => match level {
            LogLevel::Info => info!("{message}"),
            LogLevel::Warn => warn!("{message}"),
            LogLevel::Error => error!("{message}"),
        },
        MonitorEvent::StatusChanged { .. }
        | MonitorEvent::EntriesReloaded { .. }
        | MonitorEvent::EntryUpdated { .. } => {}
    }
}

// ============================================================
// history / counts / entries
// ============================================================

async fn open_persistent_audit(config_dir: &Path) -> anyhow::Result<SqliteAuditLog> {
    let (loader, config_rx) = ConfigLoader::load(config_dir)?;
    let config = config_rx.borrow().clone();
    let Some(path) = &config.audit_database else {
        bail!("no audit_database configured in {}", config_dir.display());
    };
    Ok(SqliteAuditLog::open(&loader.resolve(path)).await?)
}

async fn history(config_dir: &Path, filter: &ChangeFilter) -> anyhow::Result<()> {
    let audit = open_persistent_audit(config_dir).await?;
    let records = audit.search(filter).await?;

    if records.is_empty() {
        println!("No changes recorded.");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {}  {} -> {}{}{}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.key,
            record.old_value,
            record.new_value,
            if record.critical { "  [critical]" } else { "" },
            if record.acknowledged { "  [approved]" } else { "" },
        );
    }
    Ok(())
}

async fn counts(config_dir: &Path, days: u32) -> anyhow::Result<()> {
    let audit = open_persistent_audit(config_dir).await?;
    let counts = audit.daily_counts(days).await?;

    if counts.is_empty() {
        println!("No changes in the last {days} day(s).");
        return Ok(());
    }
    for row in counts {
        println!("{}  {:>5}  {}", row.date, row.count, row.key);
    }
    Ok(())
}

fn entries(config_dir: &Path) -> anyhow::Result<()> {
    let (loader, config_rx) = ConfigLoader::load(config_dir)?;
    let entries_file = config_rx.borrow().entries_file.clone();
    let source = FileEntrySource::new(loader.resolve(&entries_file));

    let specs = source
        .load()
        .with_context(|| format!("failed to load {}", source.describe()))?;
    for spec in specs {
        println!(
            "{}{}  ({})",
            if spec.critical { "* " } else { "  " },
            spec.display_name,
            spec.key
        );
    }
    Ok(())
}
