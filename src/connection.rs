// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Subscriber handles.
//!
//! The transport (socket server, SSE endpoint, ...) owns connections; rooms
//! only hold them while they are joined and push snapshots through
//! [`Connection::emit`]. Emitting must never block a room: a transport that
//! cannot keep up drops the emission and is expected to detect dead peers and
//! call `leave` on its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::metrics;
use crate::tree::{TreeError, Value};
use crate::types::RoomMeta;

pub trait Connection: Send + Sync {
    /// Identity, unique among live connections.
    fn id(&self) -> &str;

    /// Rooms this connection belongs to.
    fn rooms(&self) -> Vec<RoomMeta>;

    /// Deliver a full snapshot of `room` at `version`.
    fn emit(&self, room: &RoomMeta, data: Arc<Value>, version: u64);
}

/// One snapshot as delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub room: RoomMeta,
    pub data: Arc<Value>,
    pub version: u64,
}

impl Emission {
    /// The snapshot body as a JSON document; `room` and `version` travel beside it.
    pub fn payload(&self) -> Result<String, TreeError> {
        self.data.to_json_string()
    }
}

/// A [`Connection`] that forwards emissions into a bounded channel for a
/// transport task to drain.
#[derive(Debug)]
pub struct ChannelConnection {
    id: String,
    rooms: Vec<RoomMeta>,
    tx: mpsc::Sender<Emission>,
    dropped: AtomicU64,
}

impl ChannelConnection {
    pub fn new(
        id: impl Into<String>,
        rooms: Vec<RoomMeta>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Emission>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Self {
            id: id.into(),
            rooms,
            tx,
            dropped: AtomicU64::new(0),
        });
        (conn, rx)
    }

    /// Emissions lost to a full or closed channel.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Connection for ChannelConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn rooms(&self) -> Vec<RoomMeta> {
        self.rooms.clone()
    }

    fn emit(&self, room: &RoomMeta, data: Arc<Value>, version: u64) {
        let emission = Emission {
            room: room.clone(),
            data,
            version,
        };
        let reason = match self.tx.try_send(emission) {
            Ok(()) => return,
            Err(TrySendError::Full(_)) => "full",
            Err(TrySendError::Closed(_)) => "closed",
        };
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::record_emission_dropped(reason);
        debug!(connection = %self.id, room = %room, version, reason, "Dropped emission");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_delivers_in_order() {
        let room = RoomMeta::new("ns", "r1");
        let (conn, mut rx) = ChannelConnection::new("c1", vec![room.clone()], 4);
        assert_eq!(conn.id(), "c1");
        assert_eq!(conn.rooms(), vec![room.clone()]);

        conn.emit(&room, Arc::new(Value::from(1i64)), 3);
        conn.emit(&room, Arc::new(Value::from(2i64)), 4);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.version, 3);
        assert_eq!(first.payload().unwrap(), "1");
        assert_eq!(rx.recv().await.unwrap().version, 4);
    }

    #[test]
    fn test_full_channel_drops_and_counts() {
        let room = RoomMeta::new("ns", "r1");
        let (conn, rx) = ChannelConnection::new("c1", vec![room.clone()], 1);
        let data = Arc::new(Value::Null);
        conn.emit(&room, data.clone(), 1);
        conn.emit(&room, data.clone(), 2);
        assert_eq!(conn.dropped(), 1);

        drop(rx);
        conn.emit(&room, data, 3);
        assert_eq!(conn.dropped(), 2);
    }
}
