/// Trait contracts for the collaborators the Warden engine is built against.
///
/// The engine never talks to an OS backend, a database, or a notification
/// provider directly. Each of those is injected as a trait object defined here
/// so that one detection/rollback/alert implementation serves every backend.
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::errors::WardenError;
use crate::model::*;

// ============================================================
// Value Store
// ============================================================

/// Single-value read/write against the storage backend being monitored.
///
/// One implementation exists per backend (property lists, registry, JSON
/// documents). Implementations must not cache: every `read` reflects the
/// backend's current state so that a write can be verified by re-reading.
#[async_trait]
pub trait ValueStore: Send + Sync {
    /// Read the current value.
    ///
    /// Returns [`WardenError::NotFound`] when the value does not exist and
    /// [`WardenError::StoreIo`] when the backend could not be read.
    async fn read(&self, key: &EntryKey) -> Result<String, WardenError>;

    /// Write a value, creating it if necessary.
    async fn write(&self, key: &EntryKey, value: &str) -> Result<(), WardenError>;

    /// Whether the value currently exists in the backend.
    async fn exists(&self, key: &EntryKey) -> bool;
}

// ============================================================
// Audit Log
// ============================================================

/// Persisted change history plus per-entry configuration rows.
///
/// Values cross this boundary as plaintext. Implementations that encrypt at
/// rest do so internally.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append one change record. The history is append-only apart from the
    /// acknowledgment flag.
    async fn record_change(
        &self,
        key: &EntryKey,
        old_value: &str,
        new_value: &str,
        acknowledged: bool,
        critical: bool,
    ) -> Result<(), WardenError>;

    /// Mark every unacknowledged record for `key` as acknowledged.
    ///
    /// Returns how many records were updated.
    async fn acknowledge_latest(&self, key: &EntryKey) -> Result<u64, WardenError>;

    /// Query change records, newest first.
    async fn search(&self, filter: &ChangeFilter) -> Result<Vec<ChangeRecord>, WardenError>;

    /// Insert or update the persisted configuration row for an entry.
    async fn upsert_config(
        &self,
        key: &EntryKey,
        value: &str,
        critical: bool,
    ) -> Result<(), WardenError>;

    /// All persisted configuration rows.
    async fn configurations(&self) -> Result<Vec<ConfigRecord>, WardenError>;

    /// Change counts grouped by day and key, for the last `days` days
    /// including today, oldest day first.
    async fn daily_counts(&self, days: u32) -> Result<Vec<DailyChangeCount>, WardenError>;
}

/// First day (UTC) of a `days`-long window ending today.
pub fn window_start(days: u32) -> NaiveDate {
    let today = chrono::Utc::now().date_naive();
    today - chrono::Duration::days(i64::from(days.max(1)) - 1)
}

// ============================================================
// Notification
// ============================================================

/// One transport for alert messages (webhook, SMS gateway, email relay, ...).
///
/// The dispatcher calls `deliver` once per recipient; a failure affects only
/// that recipient on that channel.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Short name used in logs (e.g. "webhook").
    fn name(&self) -> &str;

    /// Deliver `message` to a single recipient.
    async fn deliver(&self, recipient: &str, message: &str) -> Result<(), WardenError>;
}

// ============================================================
// Entry Source
// ============================================================

/// Supplies the ordered list of entries to monitor.
///
/// Implementations skip individual malformed entries and only fail when the
/// source is unreadable or yields no valid entry at all.
pub trait EntrySource: Send + Sync {
    fn load(&self) -> Result<Vec<EntrySpec>, WardenError>;

    /// Human-readable origin for log messages.
    fn describe(&self) -> String;
}
