// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-topic replication actor.
//!
//! A [`Room`] mirrors one store subtree into memory and fans every accepted
//! change out to its connections as a full snapshot.
//!
//! # Tasks
//!
//! ```text
//!            ┌────────────┐  ChangeEvent   ┌────────────┐  emit(snapshot)
//!  store ───►│  WatchFeed │ ─────────────► │ RoomActor  │ ───────────────► connections
//!            └────────────┘  (bounded)     └────────────┘
//!                                                ▲
//!                              join / leave      │ (bounded)
//!                           ┌────────────────────┘
//!                        Room handle (owned by the coordinator loop)
//! ```
//!
//! The actor owns the [`Replica`] and the connection map; nothing else touches
//! them. The handle keeps its own member set so the coordinator can decide on
//! eviction without a round trip.
//!
//! # Lifecycle
//!
//! ```text
//! Initialized → Watching → Stopped
//! ```

mod replica;

pub use replica::Replica;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::connection::Connection;
use crate::metrics::{self, Telemetry};
use crate::resilience::retry::RetryConfig;
use crate::store::{ChangeEvent, ExternalStore, WatchFeed};
use crate::tree::{TreeError, Value};
use crate::types::RoomMeta;

#[derive(Error, Debug)]
pub enum RoomError {
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("unknown watch action '{0}'")]
    UnknownAction(String),
}

impl RoomError {
    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RoomError::Tree(TreeError::KeyOutsidePrefix { .. }) => "foreign_key",
            RoomError::Tree(TreeError::TypeConflict { .. }) => "type_conflict",
            RoomError::Tree(TreeError::Decode { .. }) => "decode",
            RoomError::Tree(TreeError::Encode(_)) => "encode",
            RoomError::UnknownAction(_) => "unknown_action",
        }
    }
}

/// Room lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Created, no store data seen yet.
    Initialized,
    /// The watch feed delivered its first read.
    Watching,
    /// Terminal.
    Stopped,
}

/// Settings a room needs from the coordinator's configuration.
#[derive(Debug, Clone)]
pub struct RoomOptions {
    pub channel_size: usize,
    pub store_timeout: Duration,
    pub retry: RetryConfig,
}

enum Command {
    Join(Arc<dyn Connection>),
    Leave(String),
}

/// Handle to a running room.
pub struct Room {
    meta: RoomMeta,
    key: String,
    members: HashSet<String>,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    state: watch::Receiver<RoomState>,
    pending: Option<(RoomActor, WatchFeed, mpsc::Sender<ChangeEvent>)>,
    tasks: Vec<JoinHandle<()>>,
}

impl Room {
    /// Room for `meta`, mirroring the store subtree at `key`. Nothing runs
    /// until [`Room::start`].
    pub fn new(
        meta: RoomMeta,
        key: impl Into<String>,
        store: Arc<dyn ExternalStore>,
        options: &RoomOptions,
        telemetry: &Telemetry,
    ) -> Self {
        let key = key.into();
        let span = info_span!(parent: telemetry.span(), "room", room = %meta);
        let telemetry = telemetry.child("room", span);
        let capacity = options.channel_size.max(1);

        let (commands_tx, commands_rx) = mpsc::channel(capacity);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (state_tx, state_rx) = watch::channel(RoomState::Initialized);

        let feed = WatchFeed::new(
            store,
            key.clone(),
            options.store_timeout,
            options.retry.clone(),
            telemetry.child("watch", telemetry.span().clone()),
        );
        let actor = RoomActor {
            meta: meta.clone(),
            replica: Replica::new(key.clone()),
            snapshot: Arc::new(Value::Null),
            connections: HashMap::new(),
            commands: commands_rx,
            events: events_rx,
            state: state_tx,
            telemetry,
        };

        Self {
            meta,
            key,
            members: HashSet::new(),
            commands: commands_tx,
            cancel: CancellationToken::new(),
            state: state_rx,
            pending: Some((actor, feed, events_tx)),
            tasks: Vec::new(),
        }
    }

    pub fn meta(&self) -> &RoomMeta {
        &self.meta
    }

    /// Store subtree this room mirrors.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Spawn the watch feed and the actor loop. Calling it again is a no-op.
    pub fn start(&mut self) {
        let Some((actor, feed, events_tx)) = self.pending.take() else {
            return;
        };
        let span = actor.telemetry.span().clone();

        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(
            async move { feed.get_and_watch(&events_tx, &cancel).await }.instrument(span.clone()),
        ));

        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(actor.run(cancel).instrument(span)));
        metrics::record_room_lifecycle("created");
        debug!(room = %self.meta, key = %self.key, "Room started");
    }

    /// Add a connection. A connection already joined is ignored.
    ///
    /// Waits while the room's membership channel is full.
    pub async fn join(&mut self, conn: Arc<dyn Connection>) {
        if !self.members.insert(conn.id().to_string()) {
            return;
        }
        // A stopped actor has nothing left to deliver to
        let _ = self.commands.send(Command::Join(conn)).await;
    }

    /// Remove a connection. Unknown ids are ignored.
    pub async fn leave(&mut self, id: &str) {
        if !self.members.remove(id) {
            return;
        }
        let _ = self.commands.send(Command::Leave(id.to_string())).await;
    }

    /// No connections left.
    #[must_use]
    pub fn empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn state(&self) -> RoomState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<RoomState> {
        self.state.clone()
    }

    /// Signal both tasks to exit. Safe to call any number of times.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for both tasks to finish.
    pub async fn shutdown(mut self) {
        self.stop();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(room = %self.meta, error = %e, "Room task ended abnormally");
            }
        }
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct RoomActor {
    meta: RoomMeta,
    replica: Replica,
    /// Shared copy of the replica's tree, rebuilt once per applied change
    snapshot: Arc<Value>,
    connections: HashMap<String, Arc<dyn Connection>>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Receiver<ChangeEvent>,
    state: watch::Sender<RoomState>,
    telemetry: Telemetry,
}

impl RoomActor {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(command) = self.commands.recv() => self.handle(command),

                Some(event) = self.events.recv() => self.on_event(&event),

                else => break,
            }
        }
        let _ = self.state.send(RoomState::Stopped);
        info!(version = self.replica.version(), "Room stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Join(conn) => {
                if self.replica.version() > 0 {
                    conn.emit(&self.meta, self.snapshot.clone(), self.replica.version());
                }
                debug!(connection = conn.id(), "Connection joined");
                self.connections.insert(conn.id().to_string(), conn);
            }
            Command::Leave(id) => {
                self.connections.remove(&id);
                debug!(connection = %id, "Connection left");
            }
        }
    }

    fn on_event(&mut self, event: &ChangeEvent) {
        if *self.state.borrow() == RoomState::Initialized {
            let _ = self.state.send(RoomState::Watching);
        }

        match self.replica.apply_change(event) {
            Ok(true) => {
                metrics::record_change_applied(event.action.as_str());
                self.snapshot = Arc::new(self.replica.value().clone());
                self.broadcast();
            }
            Ok(false) => {
                debug!(index = event.index, version = self.replica.version(), "Dropped stale event");
                self.telemetry.event("stale");
            }
            Err(e) => {
                warn!(
                    action = %event.action,
                    key = %event.node.key,
                    index = event.index,
                    error = %e,
                    "Failed to apply change"
                );
                self.telemetry.error("apply", e.kind());
            }
        }
    }

    fn broadcast(&self) {
        let version = self.replica.version();
        for conn in self.connections.values() {
            conn.emit(&self.meta, self.snapshot.clone(), version);
        }
        metrics::record_broadcast(self.connections.len());
    }
}
