//! Rollback engine.
//!
//! Restores critical entries to their accepted baseline when the store
//! drifts, and implements the approval side of the protocol: an approved
//! pending value is written back as authoritative and becomes the new
//! baseline. Every write is verified by re-reading the store. Write failures
//! are logged and reported through [`RollbackOutcome::Failed`]; the entry
//! stays divergent and the next scan retries.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use warden_types::errors::WardenError;
use warden_types::model::{EntryKey, LogLevel, MonitorEvent};
use warden_types::traits::{AuditLog, ValueStore};

use crate::registry::MonitoredEntry;

/// What a rollback check did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// Not armed, not critical, no baseline, or no divergence.
    NotNeeded,
    /// The baseline was written back and verified.
    Restored { value: String },
    /// The store could not be restored; the entry remains divergent.
    Failed,
}

pub struct RollbackEngine {
    store: Arc<dyn ValueStore>,
    audit: Arc<dyn AuditLog>,
    events: broadcast::Sender<MonitorEvent>,
    /// Keys rollback is enabled for.
    armed: HashSet<EntryKey>,
}

impl RollbackEngine {
    pub fn new(
        store: Arc<dyn ValueStore>,
        audit: Arc<dyn AuditLog>,
        events: broadcast::Sender<MonitorEvent>,
    ) -> Self {
        Self {
            store,
            audit,
            events,
            armed: HashSet::new(),
        }
    }

    pub fn register(&mut self, key: &EntryKey) {
        self.armed.insert(key.clone());
    }

    pub fn unregister(&mut self, key: &EntryKey) {
        self.armed.remove(key);
    }

    pub fn is_armed(&self, key: &EntryKey) -> bool {
        self.armed.contains(key)
    }

    /// Arm exactly the given keys.
    pub fn rearm<'a>(&mut self, keys: impl IntoIterator<Item = &'a EntryKey>) {
        self.armed = keys.into_iter().cloned().collect();
    }

    /// Restore `entry` to its baseline if the store has drifted from it.
    pub async fn rollback_if_needed(&self, entry: &mut MonitoredEntry) -> RollbackOutcome {
        if !entry.critical || !self.is_armed(&entry.key) {
            return RollbackOutcome::NotNeeded;
        }
        let Some(baseline) = entry.previous_value.clone() else {
            return RollbackOutcome::NotNeeded;
        };

        let observed = match self.store.read(&entry.key).await {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "rollback skipped, store unreadable");
                return RollbackOutcome::Failed;
            }
        };
        if observed == baseline {
            return RollbackOutcome::NotNeeded;
        }

        entry.pending_value = Some(observed.clone());

        if let Err(e) = self.write_verified(&entry.key, &baseline).await {
            warn!(key = %entry.key, error = %e, "rollback failed, will retry");
            self.emit(MonitorEvent::Log {
                level: LogLevel::Error,
                message: format!("Rollback failed for {}: {e}", entry.display_name),
            });
            entry.current_value = Some(observed);
            return RollbackOutcome::Failed;
        }

        entry.current_value = Some(baseline.clone());
        if let Err(e) = self
            .audit
            .upsert_config(&entry.key, &baseline, entry.critical)
            .await
        {
            warn!(key = %entry.key, error = %e, "failed to persist restored value");
        }

        info!(key = %entry.key, from = %observed, to = %baseline, "critical entry rolled back");
        self.emit(MonitorEvent::RollbackPerformed {
            key: entry.key.clone(),
            restored_value: baseline.clone(),
        });
        RollbackOutcome::Restored { value: baseline }
    }

    /// Approve the pending change for `entry`.
    ///
    /// Marks the rollback as cancelled, writes the pending value back as
    /// authoritative and promotes it to the baseline. Returns whether a
    /// pending value existed.
    pub async fn cancel(&self, entry: &mut MonitoredEntry) -> Result<bool, WardenError> {
        entry.rollback_cancelled = true;

        let Some(pending) = entry.pending_value.clone() else {
            return Ok(false);
        };

        self.write_verified(&entry.key, &pending).await?;

        entry.previous_value = Some(pending.clone());
        entry.current_value = Some(pending.clone());
        entry.pending_value = None;

        if let Err(e) = self
            .audit
            .upsert_config(&entry.key, &pending, entry.critical)
            .await
        {
            warn!(key = %entry.key, error = %e, "failed to persist approved value");
        }

        info!(key = %entry.key, value = %pending, "pending change approved");
        Ok(true)
    }

    /// Write `value` and confirm the store now holds it.
    async fn write_verified(&self, key: &EntryKey, value: &str) -> Result<(), WardenError> {
        self.store.write(key, value).await?;
        let stored = self.store.read(key).await?;
        if stored != value {
            return Err(WardenError::StoreIo(format!(
                "verification failed for {key}: expected '{value}', found '{stored}'"
            )));
        }
        Ok(())
    }

    fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use warden_store::MemoryAuditLog;
    use warden_types::model::EntrySpec;

    /// Store whose writes can be made to fail or to be silently ignored.
    #[derive(Default)]
    struct TestStore {
        values: Mutex<HashMap<EntryKey, String>>,
        fail_writes: AtomicBool,
        ignore_writes: AtomicBool,
    }

    impl TestStore {
        fn set(&self, key: &EntryKey, value: &str) {
            self.values.lock().unwrap().insert(key.clone(), value.to_string());
        }

        fn get(&self, key: &EntryKey) -> Option<String> {
            self.values.lock().unwrap().get(key).cloned()
        }
    }

    #[async_trait]
    impl ValueStore for TestStore {
        async fn read(&self, key: &EntryKey) -> Result<String, WardenError> {
            self.get(key)
                .ok_or_else(|| WardenError::NotFound(key.to_string()))
        }

        async fn write(&self, key: &EntryKey, value: &str) -> Result<(), WardenError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(WardenError::StoreIo("read-only".to_string()));
            }
            if !self.ignore_writes.load(Ordering::SeqCst) {
                self.set(key, value);
            }
            Ok(())
        }

        async fn exists(&self, key: &EntryKey) -> bool {
            self.get(key).is_some()
        }
    }

    struct Fixture {
        store: Arc<TestStore>,
        audit: Arc<MemoryAuditLog>,
        engine: RollbackEngine,
        events: broadcast::Receiver<MonitorEvent>,
        entry: MonitoredEntry,
    }

    fn fixture(critical: bool) -> Fixture {
        let store = Arc::new(TestStore::default());
        let audit = Arc::new(MemoryAuditLog::new());
        let (tx, events) = broadcast::channel(16);
        let mut engine = RollbackEngine::new(store.clone(), audit.clone(), tx);

        let mut entry = MonitoredEntry::from_spec(EntrySpec {
            key: EntryKey::new("L", "firewall"),
            display_name: "Firewall".to_string(),
            critical,
        });
        entry.prime("A".to_string());
        store.set(&entry.key, "A");
        if critical {
            engine.register(&entry.key);
        }

        Fixture {
            store,
            audit,
            engine,
            events,
            entry,
        }
    }

    #[tokio::test]
    async fn test_restores_baseline_and_emits_event() {
        let mut f = fixture(true);
        f.store.set(&f.entry.key, "B");

        let outcome = f.engine.rollback_if_needed(&mut f.entry).await;
        assert_eq!(outcome, RollbackOutcome::Restored { value: "A".to_string() });
        assert_eq!(f.store.get(&f.entry.key).as_deref(), Some("A"));
        assert_eq!(f.entry.pending_value.as_deref(), Some("B"));
        assert_eq!(f.entry.current_value.as_deref(), Some("A"));
        assert_eq!(f.audit.config_for(&f.entry.key).await.unwrap().value, "A");

        match f.events.try_recv().unwrap() {
            MonitorEvent::RollbackPerformed { key, restored_value } => {
                assert_eq!(key, f.entry.key);
                assert_eq!(restored_value, "A");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_divergence_is_noop() {
        let mut f = fixture(true);
        assert_eq!(f.engine.rollback_if_needed(&mut f.entry).await, RollbackOutcome::NotNeeded);
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unarmed_or_non_critical_is_noop() {
        let mut f = fixture(false);
        f.store.set(&f.entry.key, "B");
        assert_eq!(f.engine.rollback_if_needed(&mut f.entry).await, RollbackOutcome::NotNeeded);

        let mut f = fixture(true);
        f.engine.unregister(&f.entry.key);
        f.store.set(&f.entry.key, "B");
        assert_eq!(f.engine.rollback_if_needed(&mut f.entry).await, RollbackOutcome::NotNeeded);
        assert_eq!(f.store.get(&f.entry.key).as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_entry_divergent() {
        let mut f = fixture(true);
        f.store.set(&f.entry.key, "B");
        f.store.fail_writes.store(true, Ordering::SeqCst);

        assert_eq!(f.engine.rollback_if_needed(&mut f.entry).await, RollbackOutcome::Failed);
        assert_eq!(f.entry.current_value.as_deref(), Some("B"));
        assert_eq!(f.entry.previous_value.as_deref(), Some("A"));
        assert!(f.entry.is_divergent());

        f.store.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(
            f.engine.rollback_if_needed(&mut f.entry).await,
            RollbackOutcome::Restored { value: "A".to_string() }
        );
    }

    #[tokio::test]
    async fn test_unverified_write_is_failure() {
        let mut f = fixture(true);
        f.store.set(&f.entry.key, "B");
        f.store.ignore_writes.store(true, Ordering::SeqCst);

        assert_eq!(f.engine.rollback_if_needed(&mut f.entry).await, RollbackOutcome::Failed);
    }

    #[tokio::test]
    async fn test_cancel_promotes_pending() {
        let mut f = fixture(true);
        f.store.set(&f.entry.key, "D");
        f.engine.rollback_if_needed(&mut f.entry).await;
        assert_eq!(f.store.get(&f.entry.key).as_deref(), Some("A"));

        assert!(f.engine.cancel(&mut f.entry).await.unwrap());
        assert!(f.entry.rollback_cancelled);
        assert_eq!(f.entry.current_value.as_deref(), Some("D"));
        assert_eq!(f.entry.previous_value.as_deref(), Some("D"));
        assert!(f.entry.pending_value.is_none());
        assert_eq!(f.store.get(&f.entry.key).as_deref(), Some("D"));

        assert_eq!(f.engine.rollback_if_needed(&mut f.entry).await, RollbackOutcome::NotNeeded);
        assert_eq!(f.store.get(&f.entry.key).as_deref(), Some("D"));
    }

    #[tokio::test]
    async fn test_cancel_without_pending_only_sets_flag() {
        let mut f = fixture(true);
        assert!(!f.engine.cancel(&mut f.entry).await.unwrap());
        assert!(f.entry.rollback_cancelled);
        assert_eq!(f.entry.previous_value.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_cancel_write_failure_keeps_pending() {
        let mut f = fixture(true);
        f.store.set(&f.entry.key, "D");
        f.engine.rollback_if_needed(&mut f.entry).await;
        f.store.fail_writes.store(true, Ordering::SeqCst);

        assert!(f.engine.cancel(&mut f.entry).await.is_err());
        assert_eq!(f.entry.pending_value.as_deref(), Some("D"));
        assert_eq!(f.entry.previous_value.as_deref(), Some("A"));
    }
}
