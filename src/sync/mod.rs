// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable snapshot log.
//!
//! The [`Syncer`] follows one namespace through the coordinator's watch feed
//! and persists a full snapshot of every room that changes:
//!
//! ```text
//! Coordinator::watch ──► queue (bounded) ──► Coordinator::get_all ──► Sinker::sink
//!        ▲                                                              │
//!        └──────────── resume index from Sinker::latest_version ◄───────┘
//! ```
//!
//! Delivery is at-least-once. Every failing step is retried with exponential
//! backoff until it succeeds or the syncer stops; re-inserting a snapshot that
//! is already stored is harmless thanks to the unique `(cluster, version)` key.

mod sinker;
mod sql;

pub use sinker::{Change, Record, Sinker, SyncError, MAX_NAMESPACE_LEN, MAX_ROOM_LEN};
pub use sql::SqlSinker;

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::coordinator::{Coordinator, CoordinatorError};
use crate::metrics::{self, Telemetry};
use crate::resilience::retry::{Backoff, RetryConfig};
use crate::types::RoomMeta;

/// Persists snapshots of every changed room in one namespace.
pub struct Syncer {
    worker: SyncWorker,
    queue: mpsc::Sender<RoomMeta>,
    /// Queue receiver, until `start` takes it
    pending: Mutex<Option<mpsc::Receiver<RoomMeta>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Syncer {
    /// Create a stopped syncer for `namespace`. Queue size, cluster and
    /// backoff come from the coordinator's config.
    pub fn new(
        coordinator: Arc<Coordinator>,
        sinker: Arc<dyn Sinker>,
        namespace: impl Into<String>,
        telemetry: Telemetry,
    ) -> Result<Self, SyncError> {
        let namespace = namespace.into();
        if !RoomMeta::new(namespace.clone(), "_").is_valid() || namespace.chars().count() > MAX_NAMESPACE_LEN {
            return Err(CoordinatorError::InvalidNamespace(namespace).into());
        }

        let config = coordinator.config();
        let (queue, rx) = mpsc::channel(config.sync_queue_size);
        let span = info_span!(parent: telemetry.span(), "syncer", namespace = %namespace);
        let worker = SyncWorker {
            cluster: config.cluster,
            retry: config.sync_retry(),
            coordinator: coordinator.clone(),
            sinker,
            namespace,
            telemetry: telemetry.child("syncer", span),
        };

        Ok(Self {
            worker,
            queue,
            pending: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.worker.namespace
    }

    /// Spawn the watch and sync loops. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(rx) = self.pending.lock().take() else {
            return;
        };
        let span = self.worker.telemetry.span().clone();
        let watch = tokio::spawn(
            self.worker
                .clone()
                .watch_loop(self.queue.clone(), self.cancel.clone())
                .instrument(span.clone()),
        );
        let sync = tokio::spawn(self.worker.clone().sync_loop(rx, self.cancel.clone()).instrument(span));
        self.tasks.lock().extend([watch, sync]);
        info!(namespace = %self.worker.namespace, cluster = self.worker.cluster, "Syncer started");
    }

    /// Stop both loops and wait for them to exit. An in-flight snapshot that
    /// has not been stored yet is abandoned.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Syncer loop ended abnormally");
            }
        }
        info!(namespace = %self.worker.namespace, "Syncer stopped");
    }

    /// Queue `room` for a snapshot regardless of the watch feed.
    ///
    /// Waits while the queue is full.
    pub async fn add(&self, room: RoomMeta) -> Result<(), SyncError> {
        if !room.is_valid() || room.namespace != self.worker.namespace {
            return Err(CoordinatorError::InvalidRoom(room).into());
        }
        if self.cancel.is_cancelled() {
            return Err(SyncError::Stopped);
        }
        self.queue.send(room).await.map_err(|_| SyncError::Stopped)
    }

    /// Up to `size` stored snapshots of this namespace after `after_id`.
    pub async fn diff(&self, after_id: i64, size: usize) -> Result<Vec<Change>, SyncError> {
        self.worker
            .sinker
            .diff(&self.worker.namespace, after_id, size)
            .await
            .inspect_err(|e| self.worker.telemetry.error("diff", e.kind()))
    }

    /// Highest version stored for this namespace and cluster.
    pub async fn latest_version(&self) -> Result<u64, SyncError> {
        self.worker
            .sinker
            .latest_version(self.worker.cluster, &self.worker.namespace)
            .await
    }
}

impl Drop for Syncer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
struct SyncWorker {
    coordinator: Arc<Coordinator>,
    sinker: Arc<dyn Sinker>,
    namespace: String,
    cluster: u32,
    retry: RetryConfig,
    telemetry: Telemetry,
}

impl SyncWorker {
    async fn watch_loop(self, queue: mpsc::Sender<RoomMeta>, cancel: CancellationToken) {
        let Some(after) = self
            .retry_forever("latest_version", &cancel, || {
                self.sinker.latest_version(self.cluster, &self.namespace)
            })
            .await
        else {
            return;
        };
        info!(after_index = after, "Resuming namespace watch");

        if let Err(e) = self.coordinator.watch(&self.namespace, after, queue, cancel).await {
            error!(error = %e, "Namespace watch failed");
            self.telemetry.error("watch", "store");
        }
    }

    async fn sync_loop(self, mut rx: mpsc::Receiver<RoomMeta>, cancel: CancellationToken) {
        loop {
            let room = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                room = rx.recv() => room,
            };
            let Some(room) = room else { break };
            metrics::set_sync_queue_depth(rx.len());
            self.sync_room(&room, &cancel).await;
        }
    }

    /// Read the whole room and store it. Empty rooms are skipped.
    async fn sync_room(&self, room: &RoomMeta, cancel: &CancellationToken) {
        let snapshot = self
            .retry_forever("get_all", cancel, || async {
                self.coordinator.get_all(room).await.map_err(SyncError::from)
            })
            .await;
        let Some((value, version)) = snapshot else { return };
        if version == 0 {
            debug!(room = %room, "Room has no data, skipping");
            return;
        }

        let record = match Record::new(room, &value, self.cluster, version) {
            Ok(record) => record,
            Err(e) => {
                warn!(room = %room, error = %e, "Snapshot cannot be logged, skipping");
                self.telemetry.error("record", e.kind());
                return;
            }
        };
        if self
            .retry_forever("sink", cancel, || self.sinker.sink(&record))
            .await
            .is_some()
        {
            debug!(room = %room, version, "Snapshot stored");
            self.telemetry.event("synced");
        }
    }

    /// Run `op` until it succeeds. `None` once `cancel` fires or `op` fails
    /// with an error that cannot heal.
    async fn retry_forever<T, F, Fut>(
        &self,
        stage: &'static str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut backoff = Backoff::new(self.retry.clone());
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                result = op() => result,
            };
            match result {
                Ok(value) => return Some(value),
                Err(e) if !e.is_retryable() => {
                    warn!(stage, error = %e, "Sync step failed permanently, skipping");
                    self.telemetry.error(stage, e.kind());
                    return None;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        stage,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Sync step failed, retrying"
                    );
                    self.telemetry.error(stage, e.kind());
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return None,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }
}
