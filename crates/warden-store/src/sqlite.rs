//! SQLite-backed audit log.
//!
//! Persistent change history and configuration rows:
//! - Append-only change records; only the acknowledgment flag is ever updated
//! - One configuration row per entry identity (upsert)
//! - Filtered history search and per-day change counts
//!
//! Schema setup is idempotent and runs once, explicitly, when the log is
//! constructed.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::info;
use uuid::Uuid;

use warden_types::errors::WardenError;
use warden_types::model::*;
use warden_types::traits::{window_start, AuditLog};

// ============================================================
// Schema
// ============================================================

const MIGRATION_CREATE_CHANGES: &str = "\
CREATE TABLE IF NOT EXISTS changes (\
    id TEXT PRIMARY KEY, \
    locator TEXT NOT NULL, \
    value_name TEXT NOT NULL, \
    old_value TEXT NOT NULL, \
    new_value TEXT NOT NULL, \
    acknowledged INTEGER NOT NULL DEFAULT 0, \
    critical INTEGER NOT NULL DEFAULT 0, \
    timestamp_us INTEGER NOT NULL\
)";

const MIGRATION_CHANGES_KEY_INDEX: &str = "\
CREATE INDEX IF NOT EXISTS idx_changes_key \
ON changes (locator, value_name, acknowledged)";

const MIGRATION_CHANGES_TIME_INDEX: &str = "\
CREATE INDEX IF NOT EXISTS idx_changes_timestamp \
ON changes (timestamp_us)";

const MIGRATION_CREATE_CONFIGURATIONS: &str = "\
CREATE TABLE IF NOT EXISTS configurations (\
    locator TEXT NOT NULL, \
    value_name TEXT NOT NULL, \
    value TEXT NOT NULL, \
    critical INTEGER NOT NULL DEFAULT 0, \
    updated_at_us INTEGER NOT NULL, \
    PRIMARY KEY (locator, value_name)\
)";

// ============================================================
// SqliteAuditLog
// ============================================================

/// Audit log stored in a SQLite database.
pub struct SqliteAuditLog {
    pool: SqlitePool,
}

impl SqliteAuditLog {
    /// Open (creating if missing) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self, WardenError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| {
                WardenError::Persistence(format!("failed to open {}: {e}", path.display()))
            })?;
        info!(path = %path.display(), "opened audit database");
        Self::from_pool(pool).await
    }

    /// Private in-memory database, gone when the log is dropped.
    pub async fn in_memory() -> Result<Self, WardenError> {
        // Every SQLite in-memory connection is a separate database, so pin the
        // pool to one long-lived connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| WardenError::Persistence(format!("connection failed: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, applying the schema.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, WardenError> {
        let log = Self { pool };
        log.run_migrations().await?;
        Ok(log)
    }

    /// Apply the schema. Safe to run any number of times.
    async fn run_migrations(&self) -> Result<(), WardenError> {
        let migrations = [
            MIGRATION_CREATE_CHANGES,
            MIGRATION_CHANGES_KEY_INDEX,
            MIGRATION_CHANGES_TIME_INDEX,
            MIGRATION_CREATE_CONFIGURATIONS,
        ];

        for sql in migrations {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| WardenError::Persistence(format!("migration failed: {e}")))?;
        }

        info!("audit log migrations applied successfully");
        Ok(())
    }
}

#[async_trait]
impl AuditLog for SqliteAuditLog {
    async fn record_change(
        &self,
        key: &EntryKey,
        old_value: &str,
        new_value: &str,
        acknowledged: bool,
        critical: bool,
    ) -> Result<(), WardenError> {
        sqlx::query(
            "INSERT INTO changes \
             (id, locator, value_name, old_value, new_value, acknowledged, critical, timestamp_us) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&key.locator)
        .bind(&key.value_name)
        .bind(old_value)
        .bind(new_value)
        .bind(acknowledged)
        .bind(critical)
        .bind(Utc::now().timestamp_micros())
        .execute(&self.pool)
        .await
        .map_err(|e| WardenError::Persistence(format!("record change failed: {e}")))?;
        Ok(())
    }

    async fn acknowledge_latest(&self, key: &EntryKey) -> Result<u64, WardenError> {
        let result = sqlx::query(
            "UPDATE changes SET acknowledged = 1 \
             WHERE locator = ? AND value_name = ? AND acknowledged = 0",
        )
        .bind(&key.locator)
        .bind(&key.value_name)
        .execute(&self.pool)
        .await
        .map_err(|e| WardenError::Persistence(format!("acknowledge failed: {e}")))?;
        Ok(result.rows_affected())
    }

    async fn search(&self, filter: &ChangeFilter) -> Result<Vec<ChangeRecord>, WardenError> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, locator, value_name, old_value, new_value, acknowledged, critical, timestamp_us \
             FROM changes WHERE 1=1",
        );
        if let Some(key) = &filter.key {
            query
                .push(" AND locator = ")
                .push_bind(key.locator.clone())
                .push(" AND value_name = ")
                .push_bind(key.value_name.clone());
        }
        if let Some(since) = filter.since {
            query.push(" AND timestamp_us >= ").push_bind(since.timestamp_micros());
        }
        if let Some(until) = filter.until {
            query.push(" AND timestamp_us <= ").push_bind(until.timestamp_micros());
        }
        if let Some(ack) = filter.acknowledged {
            query.push(" AND acknowledged = ").push_bind(ack);
        }
        if let Some(critical) = filter.critical {
            query.push(" AND critical = ").push_bind(critical);
        }
        query.push(" ORDER BY timestamp_us DESC, rowid DESC");
        if let Some(limit) = filter.limit {
            query
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| WardenError::Persistence(format!("search failed: {e}")))?;

        rows.into_iter().map(row_to_change).collect()
    }

    async fn upsert_config(
        &self,
        key: &EntryKey,
        value: &str,
        critical: bool,
    ) -> Result<(), WardenError> {
        sqlx::query(
            "INSERT INTO configurations (locator, value_name, value, critical, updated_at_us) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (locator, value_name) DO UPDATE SET \
             value = excluded.value, critical = excluded.critical, updated_at_us = excluded.updated_at_us",
        )
        .bind(&key.locator)
        .bind(&key.value_name)
        .bind(value)
        .bind(critical)
        .bind(Utc::now().timestamp_micros())
        .execute(&self.pool)
        .await
        .map_err(|e| WardenError::Persistence(format!("upsert config failed: {e}")))?;
        Ok(())
    }

    async fn configurations(&self) -> Result<Vec<ConfigRecord>, WardenError> {
        let rows = sqlx::query(
            "SELECT locator, value_name, value, critical, updated_at_us \
             FROM configurations ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| WardenError::Persistence(e.to_string()))?;

        rows.into_iter().map(row_to_config).collect()
    }

    async fn daily_counts(&self, days: u32) -> Result<Vec<DailyChangeCount>, WardenError> {
        let start = window_start(days);
        let start_us = start
            .and_hms_opt(0, 0, 0)
            .map(|dt| Utc.from_utc_datetime(&dt).timestamp_micros())
            .unwrap_or_default();

        let rows = sqlx::query(
            "SELECT locator, value_name, timestamp_us FROM changes WHERE timestamp_us >= ?",
        )
        .bind(start_us)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| WardenError::Persistence(format!("daily counts failed: {e}")))?;

        let map_err = |e: sqlx::Error| WardenError::Persistence(e.to_string());
        let mut counts: BTreeMap<(NaiveDate, EntryKey), u64> = BTreeMap::new();
        for row in rows {
            let key = EntryKey::new(
                row.try_get::<String, _>("locator").map_err(map_err)?,
                row.try_get::<String, _>("value_name").map_err(map_err)?,
            );
            let date = micros_to_datetime(row.try_get("timestamp_us").map_err(map_err)?)?.date_naive();
            *counts.entry((date, key)).or_default() += 1;
        }

        Ok(counts
            .into_iter()
            .map(|((date, key), count)| DailyChangeCount { date, key, count })
            .collect())
    }
}

// ============================================================
// Helpers
// ============================================================

fn micros_to_datetime(micros: i64) -> Result<DateTime<Utc>, WardenError> {
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| WardenError::Persistence(format!("invalid timestamp: {micros}")))
}

/// Convert a `changes` row into a [`ChangeRecord`].
fn row_to_change(row: SqliteRow) -> Result<ChangeRecord, WardenError> {
    let map_err = |e: sqlx::Error| WardenError::Persistence(e.to_string());

    let id: String = row.try_get("id").map_err(map_err)?;
    Ok(ChangeRecord {
        id: Uuid::parse_str(&id)
            .map_err(|e| WardenError::Persistence(format!("invalid record id '{id}': {e}")))?,
        key: EntryKey::new(
            row.try_get::<String, _>("locator").map_err(map_err)?,
            row.try_get::<String, _>("value_name").map_err(map_err)?,
        ),
        old_value: row.try_get("old_value").map_err(map_err)?,
        new_value: row.try_get("new_value").map_err(map_err)?,
        acknowledged: row.try_get("acknowledged").map_err(map_err)?,
        critical: row.try_get("critical").map_err(map_err)?,
        timestamp: micros_to_datetime(row.try_get("timestamp_us").map_err(map_err)?)?,
    })
}

/// Convert a `configurations` row into a [`ConfigRecord`].
fn row_to_config(row: SqliteRow) -> Result<ConfigRecord, WardenError> {
    let map_err = |e: sqlx::Error| WardenError::Persistence(e.to_string());

    Ok(ConfigRecord {
        key: EntryKey::new(
            row.try_get::<String, _>("locator").map_err(map_err)?,
            row.try_get::<String, _>("value_name").map_err(map_err)?,
        ),
        value: row.try_get("value").map_err(map_err)?,
        critical: row.try_get("critical").map_err(map_err)?,
        updated_at: micros_to_datetime(row.try_get("updated_at_us").map_err(map_err)?)?,
    })
}

// ============================================================
// Tests
// ============================================================
