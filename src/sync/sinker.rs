// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable log rows and the sink they are written to.

use async_trait::async_trait;
use thiserror::Error;

use crate::coordinator::CoordinatorError;
use crate::tree::{TreeError, Value};
use crate::types::RoomMeta;

/// Column widths of the log table.
pub const MAX_NAMESPACE_LEN: usize = 60;
pub const MAX_ROOM_LEN: usize = 100;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("database error: {0}")]
    Database(String),
    #[error("record {id} holds invalid JSON: {source}")]
    Decode {
        id: i64,
        #[source]
        source: serde_json::Error,
    },
    #[error("{field} is {len} characters, the log stores at most {max}")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("version {0} does not fit the log's signed 64-bit column")]
    VersionOutOfRange(u64),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error("syncer is stopped")]
    Stopped,
}

impl SyncError {
    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Database(_) => "database",
            SyncError::Decode { .. } => "decode",
            SyncError::TooLong { .. } => "too_long",
            SyncError::VersionOutOfRange(_) => "version_range",
            SyncError::Tree(_) => "encode",
            SyncError::Coordinator(_) => "store",
            SyncError::Stopped => "stopped",
        }
    }

    /// Whether the same call can succeed later. Rows the log can never hold
    /// are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Database(_) | SyncError::Coordinator(_))
    }
}

/// One persisted snapshot of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Assigned by the database; 0 until persisted.
    pub id: i64,
    pub namespace: String,
    pub room: String,
    /// Snapshot as a JSON document
    pub value: String,
    /// Store-cluster generation the version belongs to
    pub cluster: u32,
    pub version: u64,
    /// Unix epoch milliseconds
    pub created_at: i64,
}

impl Record {
    /// Record for a snapshot of `room` at `version`, stamped with the current time.
    ///
    /// Fails with [`SyncError::TooLong`] when the namespace or room id exceeds
    /// its column width.
    pub fn new(room: &RoomMeta, value: &Value, cluster: u32, version: u64) -> Result<Self, SyncError> {
        check_len("namespace", &room.namespace, MAX_NAMESPACE_LEN)?;
        check_len("room", &room.id, MAX_ROOM_LEN)?;
        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Ok(Self {
            id: 0,
            namespace: room.namespace.clone(),
            room: room.id.clone(),
            value: value.to_json_string()?,
            cluster,
            version,
            created_at,
        })
    }
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), SyncError> {
    let len = value.chars().count();
    if len > max {
        return Err(SyncError::TooLong { field, len, max });
    }
    Ok(())
}

/// A decoded log entry, as returned by [`Sinker::diff`].
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub id: i64,
    pub room: String,
    pub value: Value,
    pub version: u64,
}

/// Append-only snapshot log.
#[async_trait]
pub trait Sinker: Send + Sync {
    /// Append `record`. A record whose `(cluster, version)` is already stored
    /// is accepted without writing anything.
    async fn sink(&self, record: &Record) -> Result<(), SyncError>;

    /// Highest version stored for `namespace` in `cluster`, 0 when empty.
    async fn latest_version(&self, cluster: u32, namespace: &str) -> Result<u64, SyncError>;

    /// Up to `size` entries of `namespace` with an id greater than `after_id`,
    /// in id order.
    async fn diff(&self, namespace: &str, after_id: i64, size: usize) -> Result<Vec<Change>, SyncError>;
}
