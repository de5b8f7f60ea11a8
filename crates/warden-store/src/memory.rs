//! In-memory audit log.
//!
//! Keeps the full history for the life of the process. Used when no audit
//! database is configured and as the persistence collaborator in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use warden_types::errors::WardenError;
use warden_types::model::*;
use warden_types::traits::{window_start, AuditLog};

/// Audit log held entirely in memory.
#[derive(Default)]
pub struct MemoryAuditLog {
    /// Change records in insertion order.
    changes: RwLock<Vec<ChangeRecord>>,
    /// Configuration rows in first-upsert order.
    configs: RwLock<Vec<ConfigRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every change record, oldest first.
    pub async fn all_changes(&self) -> Vec<ChangeRecord> {
        self.changes.read().await.clone()
    }

    /// The persisted configuration row for one key.
    pub async fn config_for(&self, key: &EntryKey) -> Option<ConfigRecord> {
        self.configs
            .read()
            .await
            .iter()
            .find(|c| &c.key == key)
            .cloned()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn record_change(
        &self,
        key: &EntryKey,
        old_value: &str,
        new_value: &str,
        acknowledged: bool,
        critical: bool,
    ) -> Result<(), WardenError> {
        self.changes.write().await.push(ChangeRecord {
            id: Uuid::new_v4(),
            key: key.clone(),
            old_value: old_value.to_string(),
            new_value: new_value.to_string(),
            acknowledged,
            critical,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn acknowledge_latest(&self, key: &EntryKey) -> Result<u64, WardenError> {
        let mut changes = self.changes.write().await;
        let mut updated = 0u64;
        for record in changes
            .iter_mut()
            .filter(|r| &r.key == key && !r.acknowledged)
        {
            record.acknowledged = true;
            updated += 1;
        }
        Ok(updated)
    }

    async fn search(&self, filter: &ChangeFilter) -> Result<Vec<ChangeRecord>, WardenError> {
        let changes = self.changes.read().await;
        let matching = changes.iter().rev().filter(|r| filter.matches(r)).cloned();
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn upsert_config(
        &self,
        key: &EntryKey,
        value: &str,
        critical: bool,
    ) -> Result<(), WardenError> {
        let mut configs = self.configs.write().await;
        let now = Utc::now();
        match configs.iter_mut().find(|c| &c.key == key) {
            Some(existing) => {
                existing.value = value.to_string();
                existing.critical = critical;
                existing.updated_at = now;
            }
            None => configs.push(ConfigRecord {
                key: key.clone(),
                value: value.to_string(),
                critical,
                updated_at: now,
            }),
        }
        Ok(())
    }

    async fn configurations(&self) -> Result<Vec<ConfigRecord>, WardenError> {
        Ok(self.configs.read().await.clone())
    }

    async fn daily_counts(&self, days: u32) -> Result<Vec<DailyChangeCount>, WardenError> {
        let start = window_start(days);
        let mut counts: BTreeMap<(chrono::NaiveDate, EntryKey), u64> = BTreeMap::new();
        for record in self.changes.read().await.iter() {
            let date = record.timestamp.date_naive();
            if date >= start {
                *counts.entry((date, record.key.clone())).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|((date, key), count)| DailyChangeCount { date, key, count })
            .collect())
    }
}
