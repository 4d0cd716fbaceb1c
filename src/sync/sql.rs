// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL snapshot log.
//!
//! ```sql
//! CREATE TABLE records (
//!   id BIGINT AUTO_INCREMENT PRIMARY KEY,
//!   namespace VARCHAR(60) NOT NULL,
//!   room VARCHAR(100) NOT NULL,
//!   value LONGTEXT,
//!   cluster BIGINT NOT NULL,
//!   version BIGINT NOT NULL,
//!   created_at BIGINT NOT NULL,
//!   UNIQUE KEY uniq_cluster_version (cluster, version)
//! )
//! ```
//!
//! The unique `(cluster, version)` key makes re-inserting a snapshot after a
//! retry harmless: the violation is reported as success.
//!
//! ## sqlx Any Driver Quirks
//!
//! Integers are bound and read as `i64`. MySQL hands LONGTEXT back as bytes,
//! so text columns are read as `String` first and as `Vec<u8>` second.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::debug;

use crate::metrics;
use crate::resilience::retry::{retry, RetryConfig};
use crate::tree::Value;

use super::sinker::{Change, Record, SyncError, Sinker};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqlSinker {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlSinker {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// create the table if needed.
    pub async fn new(connection_string: &str) -> Result<Self, SyncError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 10 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| SyncError::Database(e.to_string()))
        })
        .await?;

        let sinker = Self { pool, is_sqlite };
        sinker.init_schema().await?;
        Ok(sinker)
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn init_schema(&self) -> Result<(), SyncError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    namespace TEXT NOT NULL,
                    room TEXT NOT NULL,
                    value TEXT,
                    cluster INTEGER NOT NULL,
                    version INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    UNIQUE (cluster, version)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_records_namespace ON records (namespace, id)",
            ]
        } else {
            &[r#"
                CREATE TABLE IF NOT EXISTS records (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    namespace VARCHAR(60) NOT NULL,
                    room VARCHAR(100) NOT NULL,
                    value LONGTEXT,
                    cluster BIGINT NOT NULL,
                    version BIGINT NOT NULL,
                    created_at BIGINT NOT NULL,
                    UNIQUE KEY uniq_cluster_version (cluster, version),
                    INDEX idx_namespace (namespace, id)
                )
                "#]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| SyncError::Database(e.to_string()))
            })
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Sinker for SqlSinker {
    async fn sink(&self, record: &Record) -> Result<(), SyncError> {
        let version = i64::try_from(record.version).map_err(|_| SyncError::VersionOutOfRange(record.version))?;
        let result = sqlx::query(
            "INSERT INTO records (namespace, room, value, cluster, version, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.namespace)
        .bind(&record.room)
        .bind(&record.value)
        .bind(i64::from(record.cluster))
        .bind(version)
        .bind(record.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                metrics::record_sink(false);
                Ok(())
            }
            Err(e) if e.as_database_error().is_some_and(|db| db.is_unique_violation()) => {
                debug!(cluster = record.cluster, version = record.version, "Record already stored");
                metrics::record_sink(true);
                Ok(())
            }
            Err(e) => Err(SyncError::Database(e.to_string())),
        }
    }

    async fn latest_version(&self, cluster: u32, namespace: &str) -> Result<u64, SyncError> {
        let row = sqlx::query("SELECT MAX(version) AS latest FROM records WHERE cluster = ? AND namespace = ?")
            .bind(i64::from(cluster))
            .bind(namespace)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        // NULL on an empty table
        let latest: Option<i64> = row.try_get("latest").ok().flatten();
        Ok(latest.unwrap_or(0).max(0) as u64)
    }

    async fn diff(&self, namespace: &str, after_id: i64, size: usize) -> Result<Vec<Change>, SyncError> {
        let rows = sqlx::query(
            "SELECT id, room, value, version FROM records WHERE namespace = ? AND id > ? ORDER BY id LIMIT ?",
        )
        .bind(namespace)
        .bind(after_id)
        .bind(size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.iter().map(decode_change).collect()
    }
}

fn decode_change(row: &AnyRow) -> Result<Change, SyncError> {
    let id: i64 = row
        .try_get("id")
        .map_err(|e| SyncError::Database(e.to_string()))?;
    let version: i64 = row
        .try_get("version")
        .map_err(|e| SyncError::Database(e.to_string()))?;
    let room = text_column(row, "room").unwrap_or_default();
    let value = match text_column(row, "value") {
        Some(raw) if !raw.is_empty() => {
            Value::from_json_str(&raw).map_err(|source| SyncError::Decode { id, source })?
        }
        _ => Value::Null,
    };
    Ok(Change {
        id,
        room,
        value,
        version: version.max(0) as u64,
    })
}

/// Try reading as String first (SQLite TEXT), then as bytes (MySQL LONGTEXT)
fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RoomMeta;
    use tempfile::TempDir;

    async fn sinker() -> (SqlSinker, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("records.db").display());
        (SqlSinker::new(&url).await.unwrap(), dir)
    }

    fn record(room: &str, raw: &str, version: u64) -> Record {
        let value = Value::from_json_str(raw).unwrap();
        Record::new(&RoomMeta::new("ns", room), &value, 1, version).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_cluster_version_is_accepted_once() {
        let (sinker, _dir) = sinker().await;
        let rec = record("r1", r#"{"a": 1}"#, 10);
        sinker.sink(&rec).await.unwrap();
        sinker.sink(&rec).await.unwrap();

        let changes = sinker.diff("ns", 0, 100).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].version, 10);
    }

    #[tokio::test]
    async fn test_same_version_other_cluster_is_distinct() {
        let (sinker, _dir) = sinker().await;
        let mut rec = record("r1", "1", 10);
        sinker.sink(&rec).await.unwrap();
        rec.cluster = 2;
        sinker.sink(&rec).await.unwrap();
        assert_eq!(sinker.diff("ns", 0, 100).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_latest_version() {
        let (sinker, _dir) = sinker().await;
        assert_eq!(sinker.latest_version(1, "ns").await.unwrap(), 0);

        sinker.sink(&record("r1", "1", 5)).await.unwrap();
        sinker.sink(&record("r2", "2", 9)).await.unwrap();
        assert_eq!(sinker.latest_version(1, "ns").await.unwrap(), 9);
        assert_eq!(sinker.latest_version(1, "other").await.unwrap(), 0);
        assert_eq!(sinker.latest_version(2, "ns").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_diff_pages_in_id_order() {
        let (sinker, _dir) = sinker().await;
        for (i, room) in ["r1", "r2", "r1"].iter().enumerate() {
            sinker
                .sink(&record(room, &format!(r#"{{"n": {i}}}"#), 100 + i as u64))
                .await
                .unwrap();
        }

        let first = sinker.diff("ns", 0, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].room, "r1");
        assert_eq!(first[1].room, "r2");
        assert_eq!(first[1].value, Value::from_json_str(r#"{"n": 1}"#).unwrap());

        let rest = sinker.diff("ns", first[1].id, 10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].version, 102);
        assert!(sinker.diff("other", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_version_above_i64_is_rejected() {
        let (sinker, _dir) = sinker().await;
        let err = sinker.sink(&record("r1", "1", u64::MAX)).await.unwrap_err();
        assert!(matches!(err, SyncError::VersionOutOfRange(u64::MAX)));
        assert!(!err.is_retryable());
        assert!(sinker.diff("ns", 0, 10).await.unwrap().is_empty());

        let max = i64::MAX as u64;
        sinker.sink(&record("r1", "1", max)).await.unwrap();
        assert_eq!(sinker.latest_version(1, "ns").await.unwrap(), max);
    }
}
