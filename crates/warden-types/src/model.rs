/// Shared data types used across all Warden crates.
///
/// Entry identities, audit records, and the observer event payloads live here
/// so that the engine, the persistence backends, and any front end agree on
/// the same structures.
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================
// Entry Types
// ============================================================

/// Identity of a monitored value: a backend locator plus the value name.
///
/// The locator is backend specific (a plist path, a registry key path, a
/// JSON document path). The pair is unique within one monitor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    /// Where the value lives in the backend.
    pub locator: String,
    /// Name of the value at that location.
    pub value_name: String,
}

impl EntryKey {
    /// Separator used by the textual form of a key.
    pub const SEPARATOR: &'static str = "::";

    pub fn new(locator: impl Into<String>, value_name: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            value_name: value_name.into(),
        }
    }

    /// Parse the `locator::value_name` form produced by `Display`.
    ///
    /// Splits on the last separator so locators may themselves contain `::`.
    pub fn parse(s: &str) -> Option<Self> {
        let (locator, value_name) = s.rsplit_once(Self::SEPARATOR)?;
        if locator.is_empty() || value_name.is_empty() {
            return None;
        }
        Some(Self::new(locator, value_name))
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.locator, Self::SEPARATOR, self.value_name)
    }
}

/// One entry as declared by an entry source, before it is monitored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySpec {
    pub key: EntryKey,
    /// Human-readable label; defaults to the value name.
    pub display_name: String,
    pub critical: bool,
}

/// Read-only view of a monitored entry, published for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub key: EntryKey,
    pub display_name: String,
    /// Last value observed in the store, `None` until first read.
    pub current_value: Option<String>,
    /// Accepted baseline that rollback restores.
    pub previous_value: Option<String>,
    /// Divergent value held while a critical change is unresolved.
    pub pending_value: Option<String>,
    pub critical: bool,
    pub change_count: u32,
}

// ============================================================
// Audit Types
// ============================================================

/// One observed change, as stored in the audit history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: Uuid,
    pub key: EntryKey,
    pub old_value: String,
    pub new_value: String,
    /// Whether a human has approved this change.
    pub acknowledged: bool,
    pub critical: bool,
    pub timestamp: DateTime<Utc>,
}

/// Filters for querying the audit history. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub key: Option<EntryKey>,
    /// Inclusive lower bound on the record timestamp.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the record timestamp.
    pub until: Option<DateTime<Utc>>,
    pub acknowledged: Option<bool>,
    pub critical: Option<bool>,
    /// Maximum number of records, newest first.
    pub limit: Option<usize>,
}

impl ChangeFilter {
    /// Check a record against every set field except `limit`.
    pub fn matches(&self, record: &ChangeRecord) -> bool {
        if let Some(key) = &self.key {
            if &record.key != key {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.timestamp > until {
                return false;
            }
        }
        if let Some(ack) = self.acknowledged {
            if record.acknowledged != ack {
                return false;
            }
        }
        if let Some(critical) = self.critical {
            if record.critical != critical {
                return false;
            }
        }
        true
    }
}

/// Persisted configuration row for one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub key: EntryKey,
    pub value: String,
    pub critical: bool,
    pub updated_at: DateTime<Utc>,
}

/// Number of changes recorded for one key on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyChangeCount {
    pub date: NaiveDate,
    pub key: EntryKey,
    pub count: u64,
}

// ============================================================
// Observer Events
// ============================================================

/// Lifecycle state of the scan loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorStatus {
    Stopped,
    Running,
}

/// Severity attached to a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Events published by the monitor for any front end to consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MonitorEvent {
    /// The scan loop started or stopped.
    StatusChanged {
        status: MonitorStatus,
        message: String,
    },
    /// Free-form operational message.
    Log { level: LogLevel, message: String },
    /// A critical entry drifted; `message` is the alert text.
    CriticalChangeDetected { key: EntryKey, message: String },
    /// A human approved the pending change for `key`.
    ChangeAcknowledged { key: EntryKey, records: u64 },
    /// A critical entry was restored to its baseline.
    RollbackPerformed { key: EntryKey, restored_value: String },
    /// The active entry set was replaced.
    EntriesReloaded { count: usize },
    /// Display-relevant state of one entry changed.
    EntryUpdated { key: EntryKey },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &EntryKey, ack: bool, critical: bool) -> ChangeRecord {
        ChangeRecord {
            id: Uuid::new_v4(),
            key: key.clone(),
            old_value: "a".to_string(),
            new_value: "b".to_string(),
            acknowledged: ack,
            critical,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_entry_key_display_and_parse() {
        let key = EntryKey::new("/Library/Preferences/com.apple.alf.plist", "globalstate");
        let text = key.to_string();
        assert_eq!(text, "/Library/Preferences/com.apple.alf.plist::globalstate");
        assert_eq!(EntryKey::parse(&text), Some(key));
    }

    #[test]
    fn test_entry_key_parse_uses_last_separator() {
        let key = EntryKey::parse("a::b::c").unwrap();
        assert_eq!(key.locator, "a::b");
        assert_eq!(key.value_name, "c");
    }

    #[test]
    fn test_entry_key_parse_rejects_incomplete() {
        assert!(EntryKey::parse("no-separator").is_none());
        assert!(EntryKey::parse("::name").is_none());
        assert!(EntryKey::parse("locator::").is_none());
    }

    #[test]
    fn test_filter_matches_all_when_empty() {
        let key = EntryKey::new("L", "v");
        assert!(ChangeFilter::default().matches(&record(&key, false, false)));
    }

    #[test]
    fn test_filter_by_key_and_flags() {
        let key = EntryKey::new("L", "v");
        let other = EntryKey::new("M", "v");
        let filter = ChangeFilter {
            key: Some(key.clone()),
            acknowledged: Some(false),
            critical: Some(true),
            ..Default::default()
        };
        assert!(filter.matches(&record(&key, false, true)));
        assert!(!filter.matches(&record(&other, false, true)));
        assert!(!filter.matches(&record(&key, true, true)));
        assert!(!filter.matches(&record(&key, false, false)));
    }

    #[test]
    fn test_filter_time_bounds() {
        let key = EntryKey::new("L", "v");
        let rec = record(&key, false, false);
        let before = rec.timestamp - chrono::Duration::minutes(5);
        let after = rec.timestamp + chrono::Duration::minutes(5);

        let inside = ChangeFilter {
            since: Some(before),
            until: Some(after),
            ..Default::default()
        };
        assert!(inside.matches(&rec));

        let too_late = ChangeFilter {
            since: Some(after),
            ..Default::default()
        };
        assert!(!too_late.matches(&rec));
    }
}
