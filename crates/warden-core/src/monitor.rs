//! Monitor: the scan loop and its public control surface.
//!
//! A single worker task owns the entry registry, the rollback engine and all
//! per-entry state. Scan ticks and control commands (start/stop, approve,
//! set-critical, reload, reconfigure, deferred-alert firing) are processed
//! one at a time on that task, so:
//! - ticks never overlap and overdue ticks are skipped
//! - an approval always lands strictly between two scans
//! - a reload swaps the whole entry set between two scans
//!
//! Per entry, per scan:
//! 1. Read the store; on failure keep the last-known value and retry later
//! 2. Unchanged values are a no-op, except that a critical entry still
//!    diverging from its baseline gets its rollback retried
//! 3. Record the change as unacknowledged
//! 4. Suppress values that were already alerted (debounce)
//! 5. Critical: roll back and raise a critical alert (immediate or deferred)
//! 6. Non-critical: accept the value and raise a threshold alert every
//!    N changes
//! 7. Persist the value the store now holds
//!
//! Alert delivery runs on spawned tasks so a slow channel never stalls the
//! scan loop. [`MonitorEvent`]s are broadcast for any number of observers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use warden_channels::dispatcher::{AlertDispatcher, DispatchPolicy};
use warden_types::config::{AlertConfig, CriticalAlertTiming, WardenConfig, DEFAULT_POLL_INTERVAL_MS};
use warden_types::errors::WardenError;
use warden_types::model::*;
use warden_types::traits::{AuditLog, EntrySource, ValueStore};

use crate::registry::{EntryRegistry, MonitoredEntry};
use crate::rollback::{RollbackEngine, RollbackOutcome};

/// Pending commands before senders wait.
const COMMAND_BUFFER: usize = 64;

/// Events retained for slow observers before they start lagging.
const EVENT_BUFFER: usize = 256;

/// Runtime settings of the scan loop.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub alerts: AlertConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            alerts: AlertConfig::default(),
        }
    }
}

impl From<&WardenConfig> for MonitorConfig {
    fn from(config: &WardenConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            alerts: config.alerts.clone(),
        }
    }
}

/// Collaborators injected into the monitor.
pub struct MonitorDeps {
    /// Backend holding the monitored values.
    pub store: Arc<dyn ValueStore>,
    /// Change history and configuration persistence.
    pub audit: Arc<dyn AuditLog>,
    /// Rate-limited alert sender.
    pub dispatcher: Arc<AlertDispatcher>,
    /// Where the entry list comes from.
    pub source: Arc<dyn EntrySource>,
}

enum Command {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    ScanNow(oneshot::Sender<()>),
    AllowChange {
        key: EntryKey,
        reply: oneshot::Sender<Result<(), WardenError>>,
    },
    SetCritical {
        key: EntryKey,
        critical: bool,
        reply: oneshot::Sender<Result<(), WardenError>>,
    },
    Reload(oneshot::Sender<Result<usize, WardenError>>),
    Reconfigure {
        config: MonitorConfig,
        reply: oneshot::Sender<()>,
    },
    FireDeferredAlert {
        key: EntryKey,
        generation: u64,
        message: String,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Handle to a running monitor worker.
pub struct Monitor {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<MonitorEvent>,
    snapshots: watch::Receiver<Vec<EntrySnapshot>>,
    status: watch::Receiver<MonitorStatus>,
    worker: JoinHandle<()>,
}

impl Monitor {
    /// Spawn the worker. The entry list is loaded before any command is
    /// processed; the scan loop stays stopped until [`Monitor::start`].
    pub fn spawn(deps: MonitorDeps, config: MonitorConfig) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (snapshot_tx, snapshots) = watch::channel(Vec::new());
        let (status_tx, status) = watch::channel(MonitorStatus::Stopped);

        let worker = Worker {
            rollback: RollbackEngine::new(deps.store.clone(), deps.audit.clone(), events.clone()),
            store: deps.store,
            audit: deps.audit,
            dispatcher: deps.dispatcher,
            source: deps.source,
            registry: EntryRegistry::new(),
            config,
            events: events.clone(),
            snapshots: snapshot_tx,
            status: status_tx,
            commands: commands.downgrade(),
            running: false,
        };
        let worker = tokio::spawn(worker.run(rx));

        Self {
            commands,
            events,
            snapshots,
            status,
            worker,
        }
    }

    /// Begin periodic scanning. No-op when already running.
    pub async fn start(&self) -> Result<(), WardenError> {
        self.request(Command::Start).await
    }

    /// Stop periodic scanning. No-op when already stopped.
    pub async fn stop(&self) -> Result<(), WardenError> {
        self.request(Command::Stop).await
    }

    /// Run one scan now, independent of the timer, and wait for it.
    pub async fn scan_once(&self) -> Result<(), WardenError> {
        self.request(Command::ScanNow).await
    }

    /// Approve the pending change for `key`: acknowledge its audit records,
    /// cancel any deferred critical alert and make the pending value the
    /// new baseline.
    pub async fn allow_change(&self, key: &EntryKey) -> Result<(), WardenError> {
        self.request(|reply| Command::AllowChange {
            key: key.clone(),
            reply,
        })
        .await?
    }

    pub async fn set_critical_status(&self, key: &EntryKey, critical: bool) -> Result<(), WardenError> {
        self.request(|reply| Command::SetCritical {
            key: key.clone(),
            critical,
            reply,
        })
        .await?
    }

    /// Reload the entry list. On failure the current set stays active.
    ///
    /// Returns the number of active entries.
    pub async fn reload(&self) -> Result<usize, WardenError> {
        self.request(Command::Reload).await?
    }

    /// Apply new scan and alert settings.
    pub async fn reconfigure(&self, config: MonitorConfig) -> Result<(), WardenError> {
        self.request(|reply| Command::Reconfigure { config, reply }).await
    }

    /// The latest published entry list, in registry order.
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Receiver that is notified whenever a new entry list is published.
    pub fn watch_snapshots(&self) -> watch::Receiver<Vec<EntrySnapshot>> {
        self.snapshots.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> MonitorStatus {
        *self.status.borrow()
    }

    /// Stop the worker and wait for it to exit.
    pub async fn shutdown(self) -> Result<(), WardenError> {
        self.request(Command::Shutdown).await?;
        self.worker
            .await
            .map_err(|e| WardenError::Internal(format!("monitor worker failed: {e}")))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, WardenError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| WardenError::MonitorStopped)?;
        rx.await.map_err(|_| WardenError::MonitorStopped)
    }
}

// ============================================================
// Worker
// ============================================================

/// An alert decided during a scan.
enum AlertAction {
    Now(String),
    Deferred {
        key: EntryKey,
        generation: u64,
        message: String,
    },
}

struct Worker {
    store: Arc<dyn ValueStore>,
    audit: Arc<dyn AuditLog>,
    dispatcher: Arc<AlertDispatcher>,
    source: Arc<dyn EntrySource>,
    registry: EntryRegistry,
    rollback: RollbackEngine,
    config: MonitorConfig,
    events: broadcast::Sender<MonitorEvent>,
    snapshots: watch::Sender<Vec<EntrySnapshot>>,
    status: watch::Sender<MonitorStatus>,
    /// Weak so that dropping every [`Monitor`] handle ends the worker.
    commands: mpsc::WeakSender<Command>,
    running: bool,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        if let Err(e) = self.reload().await {
            warn!(error = %e, "initial entry load failed, monitoring idle until a successful reload");
            self.log_event(LogLevel::Error, format!("Failed to load entries: {e}"));
        }

        let mut ticker = new_ticker(self.config.poll_interval);
        loop {
            tokio::select! {
                scheduled = ticker.tick(), if self.running => {
                    let lateness = Instant::now().saturating_duration_since(scheduled);
                    if lateness >= self.config.poll_interval {
                        warn!(late_ms = lateness.as_millis() as u64, "scan overran the poll interval, missed ticks skipped");
                    }
                    self.scan().await;
                }
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle(command, &mut ticker).await {
                        break;
                    }
                }
            }
        }
        debug!("monitor worker exited");
    }

    /// Process one command. Returns false when the worker should exit.
    async fn handle(&mut self, command: Command, ticker: &mut Interval) -> bool {
        match command {
            Command::Start(reply) => {
                if !self.running {
                    *ticker = new_ticker(self.config.poll_interval);
                    self.set_running(true);
                }
                let _ = reply.send(());
            }
            Command::Stop(reply) => {
                if self.running {
                    self.set_running(false);
                }
                let _ = reply.send(());
            }
            Command::ScanNow(reply) => {
                self.scan().await;
                let _ = reply.send(());
            }
            Command::AllowChange { key, reply } => {
                let _ = reply.send(self.allow_change(&key).await);
            }
            Command::SetCritical {
                key,
                critical,
                reply,
            } => {
                let _ = reply.send(self.set_critical_status(&key, critical).await);
            }
            Command::Reload(reply) => {
                let result = self.reload().await;
                if let Err(e) = &result {
                    warn!(error = %e, "reload failed, keeping previous entries");
                    self.log_event(LogLevel::Error, format!("Reload failed: {e}"));
                }
                let _ = reply.send(result);
            }
            Command::Reconfigure { config, reply } => {
                self.reconfigure(config, ticker).await;
                let _ = reply.send(());
            }
            Command::FireDeferredAlert {
                key,
                generation,
                message,
            } => {
                self.fire_deferred(&key, generation, message);
            }
            Command::Shutdown(reply) => {
                if self.running {
                    self.set_running(false);
                }
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn set_running(&mut self, running: bool) {
        self.running = running;
        let status = if running {
            MonitorStatus::Running
        } else {
            MonitorStatus::Stopped
        };
        self.status.send_replace(status);

        let message = if running {
            "Monitoring started"
        } else {
            "Monitoring stopped"
        };
        info!(interval_ms = self.config.poll_interval.as_millis() as u64, "{message}");
        emit(
            &self.events,
            MonitorEvent::StatusChanged {
                status,
                message: message.to_string(),
            },
        );
    }

    async fn scan(&mut self) {
        for key in self.registry.keys() {
            if let Some(action) = self.check_entry(&key).await {
                self.raise(action);
            }
        }
        self.publish();
    }

    async fn check_entry(&mut self, key: &EntryKey) -> Option<AlertAction> {
        let observed = match self.store.read(key).await {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to read value, keeping last known");
                return None;
            }
        };

        let entry = self.registry.get_mut(key)?;

        let Some(current) = entry.current_value.clone() else {
            entry.prime(observed.clone());
            debug!(key = %key, "entry primed");
            if let Err(e) = self.audit.upsert_config(key, &observed, entry.critical).await {
                warn!(key = %key, error = %e, "failed to persist configuration");
            }
            emit(&self.events, MonitorEvent::EntryUpdated { key: key.clone() });
            return None;
        };

        if observed == current {
            if entry.critical && entry.is_divergent() {
                let outcome = self.rollback.rollback_if_needed(entry).await;
                if matches!(outcome, RollbackOutcome::Restored { .. }) {
                    emit(&self.events, MonitorEvent::EntryUpdated { key: key.clone() });
                }
            }
            return None;
        }

        let critical = entry.critical;
        info!(key = %key, from = %current, to = %observed, critical, "change detected");
        if let Err(e) = self
            .audit
            .record_change(key, &current, &observed, false, critical)
            .await
        {
            warn!(key = %key, error = %e, "failed to record change");
        }

        if entry.last_alerted_value.as_deref() == Some(observed.as_str()) {
            debug!(key = %key, "value already alerted, suppressing");
            entry.current_value = Some(observed);
            emit(&self.events, MonitorEvent::EntryUpdated { key: key.clone() });
            return None;
        }
        entry.last_alerted_value = Some(observed.clone());

        let action = if critical {
            let generation = entry.begin_critical_change();
            entry.pending_value = Some(observed.clone());
            entry.current_value = Some(observed.clone());

            let outcome = self.rollback.rollback_if_needed(entry).await;
            if outcome == RollbackOutcome::NotNeeded && !entry.is_divergent() {
                entry.pending_value = None;
            }

            let message = critical_message(entry, &observed, &outcome);
            emit(
                &self.events,
                MonitorEvent::CriticalChangeDetected {
                    key: key.clone(),
                    message: message.clone(),
                },
            );
            Some(match self.config.alerts.critical_timing {
                CriticalAlertTiming::Immediate => AlertAction::Now(message),
                CriticalAlertTiming::Delayed => {
                    entry.deferred_alerts.insert(generation, false);
                    AlertAction::Deferred {
                        key: key.clone(),
                        generation,
                        message,
                    }
                }
            })
        } else {
            entry.change_count += 1;
            entry.previous_value = Some(observed.clone());
            entry.current_value = Some(observed.clone());

            match self.config.alerts.threshold() {
                Some(threshold) if entry.change_count >= threshold => {
                    entry.change_count = 0;
                    Some(AlertAction::Now(threshold_message(entry, &observed)))
                }
                _ => None,
            }
        };

        if let Some(value) = entry.current_value.clone() {
            if let Err(e) = self.audit.upsert_config(key, &value, critical).await {
                warn!(key = %key, error = %e, "failed to persist configuration");
            }
        }
        emit(&self.events, MonitorEvent::EntryUpdated { key: key.clone() });
        action
    }

    fn raise(&self, action: AlertAction) {
        match action {
            AlertAction::Now(message) => self.spawn_dispatch(message),
            AlertAction::Deferred {
                key,
                generation,
                message,
            } => {
                let grace = self.config.alerts.critical_grace();
                let commands = self.commands.clone();
                debug!(key = %key, generation, grace_secs = grace.as_secs(), "critical alert deferred");
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if let Some(tx) = commands.upgrade() {
                        let _ = tx
                            .send(Command::FireDeferredAlert {
                                key,
                                generation,
                                message,
                            })
                            .await;
                    }
                });
            }
        }
    }

    /// Deliver or drop a deferred critical alert. Only an approval of the
    /// change this alert describes suppresses it.
    fn fire_deferred(&mut self, key: &EntryKey, generation: u64, message: String) {
        let Some(entry) = self.registry.get_mut(key) else {
            debug!(key = %key, "entry no longer monitored, deferred alert dropped");
            return;
        };

        match entry.deferred_alerts.remove(&generation) {
            Some(true) => {
                if generation == entry.change_generation {
                    entry.rollback_cancelled = false;
                }
                info!(key = %key, generation, "change approved within grace window, alert suppressed");
            }
            Some(false) => self.spawn_dispatch(message),
            None => debug!(key = %key, generation, "deferred alert no longer tracked, dropped"),
        }
    }

    fn spawn_dispatch(&self, message: String) {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let outcome = dispatcher.dispatch(&message).await;
            debug!(?outcome, "alert dispatch finished");
        });
    }

    async fn allow_change(&mut self, key: &EntryKey) -> Result<(), WardenError> {
        let entry = self
            .registry
            .get_mut(key)
            .ok_or_else(|| WardenError::UnknownEntry(key.to_string()))?;

        match self.audit.acknowledge_latest(key).await {
            Ok(0) => {}
            Ok(records) => emit(
                &self.events,
                MonitorEvent::ChangeAcknowledged {
                    key: key.clone(),
                    records,
                },
            ),
            Err(e) => warn!(key = %key, error = %e, "failed to acknowledge changes"),
        }

        if entry.approve_latest_change() {
            debug!(key = %key, generation = entry.change_generation, "deferred alert will be suppressed");
        }
        let result = self.rollback.cancel(entry).await;
        match &result {
            Ok(true) => info!(key = %key, "change allowed"),
            Ok(false) => debug!(key = %key, "no pending change to allow"),
            Err(e) => warn!(key = %key, error = %e, "failed to apply allowed change"),
        }

        emit(&self.events, MonitorEvent::EntryUpdated { key: key.clone() });
        self.publish();
        result.map(|_| ())
    }

    async fn set_critical_status(&mut self, key: &EntryKey, critical: bool) -> Result<(), WardenError> {
        let entry = self
            .registry
            .get_mut(key)
            .ok_or_else(|| WardenError::UnknownEntry(key.to_string()))?;

        entry.critical = critical;
        if critical {
            self.rollback.register(key);
        } else {
            self.rollback.unregister(key);
        }

        if let Some(value) = entry.current_value.clone() {
            if let Err(e) = self.audit.upsert_config(key, &value, critical).await {
                warn!(key = %key, error = %e, "failed to persist criticality");
            }
        }

        info!(key = %key, critical, "criticality updated");
        emit(&self.events, MonitorEvent::EntryUpdated { key: key.clone() });
        self.publish();
        Ok(())
    }

    async fn reload(&mut self) -> Result<usize, WardenError> {
        // Entry sources do blocking file I/O.
        let source = self.source.clone();
        let specs = tokio::task::spawn_blocking(move || EntryRegistry::load(source.as_ref()))
            .await
            .map_err(|e| WardenError::Internal(format!("entry load task failed: {e}")))??;
        let mut next = self.registry.rebuild(specs);

        for entry in next.iter_mut().filter(|e| !e.is_primed()) {
            match self.store.read(&entry.key).await {
                Ok(value) => entry.prime(value),
                Err(e) => warn!(
                    key = %entry.key,
                    error = %e,
                    "initial read failed, entry will be primed on the first successful scan"
                ),
            }
        }

        self.rollback
            .rearm(next.iter().filter(|e| e.critical).map(|e| &e.key));
        self.registry = next;

        for entry in self.registry.iter() {
            if let Some(value) = &entry.current_value {
                if let Err(e) = self.audit.upsert_config(&entry.key, value, entry.critical).await {
                    warn!(key = %entry.key, error = %e, "failed to persist configuration");
                }
            }
        }

        let count = self.registry.len();
        info!(count, source = %self.source.describe(), "entries reloaded");
        emit(&self.events, MonitorEvent::EntriesReloaded { count });
        self.publish();
        Ok(count)
    }

    async fn reconfigure(&mut self, config: MonitorConfig, ticker: &mut Interval) {
        self.dispatcher
            .set_policy(DispatchPolicy::from(&config.alerts))
            .await;

        let interval_changed = config.poll_interval != self.config.poll_interval;
        self.config = config;
        if interval_changed {
            *ticker = new_ticker(self.config.poll_interval);
            info!(
                interval_ms = self.config.poll_interval.as_millis() as u64,
                "poll interval updated"
            );
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.registry.snapshot());
    }

    fn log_event(&self, level: LogLevel, message: String) {
        emit(&self.events, MonitorEvent::Log { level, message });
    }
}

// ============================================================
// Helpers
// ============================================================

fn emit(events: &broadcast::Sender<MonitorEvent>, event: MonitorEvent) {
    // No subscribers is fine.
    let _ = events.send(event);
}

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

fn critical_message(entry: &MonitoredEntry, observed: &str, outcome: &RollbackOutcome) -> String {
    let base = format!(
        "[CRITICAL ALERT] {} ({}) changed to {}",
        entry.display_name, entry.key, observed
    );
    match outcome {
        RollbackOutcome::Restored { value } => format!("{base}; reverted to {value}"),
        RollbackOutcome::Failed => format!("{base}; automatic revert failed"),
        RollbackOutcome::NotNeeded => base,
    }
}

fn threshold_message(entry: &MonitoredEntry, observed: &str) -> String {
    format!(
        "[ALERT] Threshold reached for {}: {}",
        entry.display_name, observed
    )
}

// ============================================================
// Tests
// ============================================================
