// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Room coordinator.
//!
//! The [`Coordinator`] is the entry point the transport and the syncer talk to:
//! - routes connection joins and leaves to rooms, creating rooms on demand
//! - evicts rooms nobody is connected to
//! - reads and writes room data in the store (`get`, `get_all`, `set`)
//! - streams which rooms of a namespace changed (`watch`)
//!
//! # Concurrency
//!
//! The room table lives inside a single main loop task. `join` and `leave`
//! only enqueue onto bounded channels and never wait for that loop; a full
//! channel is reported as [`CoordinatorError::Backpressure`]. Reads and writes
//! go straight to the store.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use room_sync::{ChannelConnection, Coordinator, MemoryStore, RoomMeta, RoomSyncConfig, Telemetry};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = Arc::new(MemoryStore::new());
//! let coordinator = Coordinator::new(store, RoomSyncConfig::default(), Telemetry::disabled("coordinator"))
//!     .expect("valid config");
//! coordinator.start();
//!
//! let room = RoomMeta::new("dashboards", "ops");
//! let (conn, mut snapshots) = ChannelConnection::new("conn-1", vec![room.clone()], 64);
//! coordinator.join(conn).expect("queue has room");
//!
//! coordinator.set(&room, "cpu", &42i64.into(), None).await.expect("store reachable");
//! let emission = snapshots.recv().await.unwrap();
//! assert_eq!(emission.payload().unwrap(), r#"{"cpu":42}"#);
//!
//! coordinator.stop().await;
//! # }
//! ```

mod api;
mod keys;
mod lifecycle;
mod types;

pub use keys::KeyMapper;
pub use types::{CoordinatorError, CoordinatorState};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RoomSyncConfig;
use crate::connection::Connection;
use crate::metrics::Telemetry;
use crate::store::ExternalStore;

use lifecycle::CoordinatorLoop;

/// Routes subscribers to rooms and fronts the store for room reads and writes.
///
/// `Send + Sync`; share it behind an [`Arc`].
pub struct Coordinator {
    pub(super) store: Arc<dyn ExternalStore>,
    pub(super) config: RoomSyncConfig,
    pub(super) keys: KeyMapper,
    pub(super) telemetry: Telemetry,

    join_tx: mpsc::Sender<Arc<dyn Connection>>,
    leave_tx: mpsc::Sender<Arc<dyn Connection>>,

    /// Lifecycle state (broadcast to watchers)
    state: watch::Sender<CoordinatorState>,
    state_rx: watch::Receiver<CoordinatorState>,

    /// Rooms currently held by the main loop
    active_rooms: watch::Receiver<usize>,

    cancel: CancellationToken,
    /// Main loop, until `start` takes it
    pending: Mutex<Option<CoordinatorLoop>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Create a coordinator in `Created` state. Call [`start()`](Self::start)
    /// to run the main loop.
    pub fn new(
        store: Arc<dyn ExternalStore>,
        config: RoomSyncConfig,
        telemetry: Telemetry,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;

        let (join_tx, join_rx) = mpsc::channel(config.coordinator_channel_size);
        let (leave_tx, leave_rx) = mpsc::channel(config.coordinator_channel_size);
        let (state_tx, state_rx) = watch::channel(CoordinatorState::Created);
        let (rooms_tx, rooms_rx) = watch::channel(0);
        let keys = KeyMapper::new(config.key_prefix.clone());

        let main_loop = CoordinatorLoop::new(
            store.clone(),
            keys.clone(),
            &config,
            join_rx,
            leave_rx,
            rooms_tx,
            telemetry.clone(),
        );

        Ok(Self {
            store,
            config,
            keys,
            telemetry,
            join_tx,
            leave_tx,
            state: state_tx,
            state_rx,
            active_rooms: rooms_rx,
            cancel: CancellationToken::new(),
            pending: Mutex::new(Some(main_loop)),
            task: Mutex::new(None),
        })
    }

    /// Get current coordinator state.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<CoordinatorState> {
        self.state_rx.clone()
    }

    /// Number of rooms the main loop currently holds.
    #[must_use]
    pub fn active_rooms(&self) -> usize {
        *self.active_rooms.borrow()
    }

    pub fn keys(&self) -> &KeyMapper {
        &self.keys
    }

    pub fn config(&self) -> &RoomSyncConfig {
        &self.config
    }

    /// Enqueue `conn` to join every room it lists.
    ///
    /// Never waits on the main loop. A full queue is
    /// [`CoordinatorError::Backpressure`]; retry later.
    pub fn join(&self, conn: Arc<dyn Connection>) -> Result<(), CoordinatorError> {
        enqueue(&self.join_tx, conn, "join")
    }

    /// Enqueue `conn` to leave every room it lists.
    pub fn leave(&self, conn: Arc<dyn Connection>) -> Result<(), CoordinatorError> {
        enqueue(&self.leave_tx, conn, "leave")
    }
}

fn enqueue(
    tx: &mpsc::Sender<Arc<dyn Connection>>,
    conn: Arc<dyn Connection>,
    queue: &'static str,
) -> Result<(), CoordinatorError> {
    tx.try_send(conn).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => {
            crate::metrics::record_error("coordinator", queue, "backpressure");
            CoordinatorError::Backpressure(queue)
        }
        mpsc::error::TrySendError::Closed(_) => CoordinatorError::Stopped,
    })
}
