//! Entry registry: the active set of monitored entries.
//!
//! Entries keep the order of the entry source. Identities are unique; when a
//! source lists the same identity twice the first occurrence wins. Rebuilding
//! the registry from a new entry list carries runtime state over for every
//! identity that survives, so a reload never resets baselines or counters.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{info, warn};

use warden_types::errors::WardenError;
use warden_types::model::{EntryKey, EntrySnapshot, EntrySpec};
use warden_types::traits::EntrySource;

/// In-memory state for one tracked value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredEntry {
    pub key: EntryKey,
    pub display_name: String,
    pub critical: bool,
    /// Last value observed in the store. `None` until the entry is primed.
    pub current_value: Option<String>,
    /// Accepted baseline that rollback restores.
    pub previous_value: Option<String>,
    /// Divergent value held while a critical change is unresolved.
    pub pending_value: Option<String>,
    /// Non-critical changes since the threshold last fired.
    pub change_count: u32,
    /// Set by an approval; cleared when the approved change's deferred alert
    /// is dropped or a new critical change begins.
    pub rollback_cancelled: bool,
    /// Most recent value an alert was raised for.
    pub last_alerted_value: Option<String>,
    /// Critical changes seen so far. Tags each deferred alert.
    pub change_generation: u64,
    /// Deferred critical alerts not yet fired, by generation, with whether
    /// their change has been approved.
    pub deferred_alerts: BTreeMap<u64, bool>,
}

impl MonitoredEntry {
    pub fn from_spec(spec: EntrySpec) -> Self {
        Self {
            key: spec.key,
            display_name: spec.display_name,
            critical: spec.critical,
            current_value: None,
            previous_value: None,
            pending_value: None,
            change_count: 0,
            rollback_cancelled: false,
            last_alerted_value: None,
            change_generation: 0,
            deferred_alerts: BTreeMap::new(),
        }
    }

    /// Adopt `value` as both the observed value and the baseline.
    pub fn prime(&mut self, value: String) {
        self.previous_value = Some(value.clone());
        self.current_value = Some(value);
    }

    pub fn is_primed(&self) -> bool {
        self.current_value.is_some()
    }

    /// Whether the observed value has drifted from the accepted baseline.
    pub fn is_divergent(&self) -> bool {
        self.current_value.is_some() && self.current_value != self.previous_value
    }

    /// Start a new critical change and return its generation.
    pub fn begin_critical_change(&mut self) -> u64 {
        self.change_generation += 1;
        self.rollback_cancelled = false;
        self.change_generation
    }

    /// Mark the latest critical change approved if its deferred alert is
    /// still waiting. Earlier changes keep their own alerts.
    pub fn approve_latest_change(&mut self) -> bool {
        match self.deferred_alerts.get_mut(&self.change_generation) {
            Some(approved) => {
                *approved = true;
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            key: self.key.clone(),
            display_name: self.display_name.clone(),
            current_value: self.current_value.clone(),
            previous_value: self.previous_value.clone(),
            pending_value: self.pending_value.clone(),
            critical: self.critical,
            change_count: self.change_count,
        }
    }
}

/// Ordered set of monitored entries keyed by identity.
#[derive(Debug, Default)]
pub struct EntryRegistry {
    entries: Vec<MonitoredEntry>,
    index: HashMap<EntryKey, usize>,
}

impl EntryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load entry specs from `source`, dropping duplicate identities.
    ///
    /// Fails only when the source itself fails or yields nothing usable.
    pub fn load(source: &dyn EntrySource) -> Result<Vec<EntrySpec>, WardenError> {
        let specs = source.load()?;

        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(specs.len());
        for spec in specs {
            if seen.insert(spec.key.clone()) {
                unique.push(spec);
            } else {
                warn!(key = %spec.key, source = %source.describe(), "duplicate entry skipped");
            }
        }

        if unique.is_empty() {
            return Err(WardenError::Config(format!(
                "no valid entries in {}",
                source.describe()
            )));
        }

        info!(count = unique.len(), source = %source.describe(), "entries loaded");
        Ok(unique)
    }

    /// Build a registry from `specs`, carrying runtime state over from `self`
    /// for identities present in both. Criticality and display name always
    /// come from the new specs.
    pub fn rebuild(&self, specs: Vec<EntrySpec>) -> EntryRegistry {
        let mut next = EntryRegistry::new();
        for spec in specs {
            if next.index.contains_key(&spec.key) {
                continue;
            }
            let entry = match self.get(&spec.key) {
                Some(existing) => MonitoredEntry {
                    display_name: spec.display_name,
                    critical: spec.critical,
                    ..existing.clone()
                },
                None => MonitoredEntry::from_spec(spec),
            };
            next.index.insert(entry.key.clone(), next.entries.len());
            next.entries.push(entry);
        }
        next
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &EntryKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn get(&self, key: &EntryKey) -> Option<&MonitoredEntry> {
        self.index.get(key).map(|&i| &self.entries[i])
    }

    pub fn get_mut(&mut self, key: &EntryKey) -> Option<&mut MonitoredEntry> {
        match self.index.get(key) {
            Some(&i) => self.entries.get_mut(i),
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MonitoredEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MonitoredEntry> {
        self.entries.iter_mut()
    }

    /// Identities in registry order.
    pub fn keys(&self) -> Vec<EntryKey> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        self.entries.iter().map(MonitoredEntry::snapshot).collect()
    }
}
