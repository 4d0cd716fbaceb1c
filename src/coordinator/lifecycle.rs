//! Coordinator lifecycle: start, stop and the main loop that owns the room table.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::RoomSyncConfig;
use crate::connection::Connection;
use crate::metrics::{self, Telemetry};
use crate::room::{Room, RoomOptions};
use crate::store::ExternalStore;
use crate::types::RoomMeta;

use super::{Coordinator, CoordinatorState, KeyMapper};

impl Coordinator {
    /// Spawn the main loop. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(main_loop) = self.pending.lock().take() else {
            return;
        };
        let span = main_loop.telemetry.span().clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(main_loop.run(cancel).instrument(span));
        *self.task.lock() = Some(handle);
        let _ = self.state.send(CoordinatorState::Running);
        info!(prefix = %self.keys.prefix(), "Coordinator started");
    }

    /// Stop the main loop and every room, then wait for the loop to exit.
    ///
    /// Safe to call more than once and before `start`.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.pending.lock().take();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Coordinator loop ended abnormally");
            }
        }
        let _ = self.state.send(CoordinatorState::Stopped);
    }
}

/// Serial event loop over joins, leaves and the maintenance tick. The room
/// table is only ever touched from here.
pub(super) struct CoordinatorLoop {
    store: Arc<dyn ExternalStore>,
    keys: KeyMapper,
    options: RoomOptions,
    maintain_interval: Duration,
    rooms: HashMap<RoomMeta, Room>,
    join_rx: mpsc::Receiver<Arc<dyn Connection>>,
    leave_rx: mpsc::Receiver<Arc<dyn Connection>>,
    rooms_gauge: watch::Sender<usize>,
    pub(super) telemetry: Telemetry,
}

impl CoordinatorLoop {
    pub(super) fn new(
        store: Arc<dyn ExternalStore>,
        keys: KeyMapper,
        config: &RoomSyncConfig,
        join_rx: mpsc::Receiver<Arc<dyn Connection>>,
        leave_rx: mpsc::Receiver<Arc<dyn Connection>>,
        rooms_gauge: watch::Sender<usize>,
        telemetry: Telemetry,
    ) -> Self {
        let span = info_span!(parent: telemetry.span(), "coordinator");
        Self {
            store,
            keys,
            options: RoomOptions {
                channel_size: config.room_channel_size,
                store_timeout: config.store_timeout(),
                retry: config.watch_retry(),
            },
            maintain_interval: config.maintain_interval(),
            rooms: HashMap::new(),
            join_rx,
            leave_rx,
            rooms_gauge,
            telemetry: telemetry.child("coordinator", span),
        }
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.maintain_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        tick.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(conn) = self.join_rx.recv() => self.on_join(conn).await,

                Some(conn) = self.leave_rx.recv() => self.on_leave(conn).await,

                _ = tick.tick() => self.maintain(),
            }
        }

        let count = self.rooms.len();
        for (_, room) in self.rooms.drain() {
            room.shutdown().await;
        }
        self.publish();
        info!(rooms = count, "Coordinator stopped");
    }

    async fn on_join(&mut self, conn: Arc<dyn Connection>) {
        let before = self.rooms.len();
        for meta in conn.rooms() {
            if !meta.is_valid() {
                warn!(connection = conn.id(), room = %meta, "Ignoring join for invalid room");
                self.telemetry.error("join", "invalid_room");
                continue;
            }
            self.ensure_room(&meta).join(conn.clone()).await;
        }
        if self.rooms.len() != before {
            self.publish();
        }
    }

    async fn on_leave(&mut self, conn: Arc<dyn Connection>) {
        for meta in conn.rooms() {
            if let Some(room) = self.rooms.get_mut(&meta) {
                room.leave(conn.id()).await;
            }
        }
    }

    fn ensure_room(&mut self, meta: &RoomMeta) -> &mut Room {
        match self.rooms.entry(meta.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut room = Room::new(
                    meta.clone(),
                    self.keys.room_key(meta),
                    self.store.clone(),
                    &self.options,
                    &self.telemetry,
                );
                room.start();
                debug!(room = %meta, "Created room");
                entry.insert(room)
            }
        }
    }

    /// Stop and drop every room without connections.
    fn maintain(&mut self) {
        let idle: Vec<RoomMeta> = self
            .rooms
            .iter()
            .filter(|(_, room)| room.empty())
            .map(|(meta, _)| meta.clone())
            .collect();

        for meta in &idle {
            if let Some(room) = self.rooms.remove(meta) {
                room.stop();
                metrics::record_room_lifecycle("evicted");
            }
        }
        if !idle.is_empty() {
            debug!(evicted = idle.len(), remaining = self.rooms.len(), "Evicted idle rooms");
            self.publish();
        }
    }

    fn publish(&self) {
        metrics::set_active_rooms(self.rooms.len());
        self.rooms_gauge.send_replace(self.rooms.len());
    }
}
