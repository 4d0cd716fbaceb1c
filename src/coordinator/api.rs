//! Store-facing API: room reads, writes and the namespace watch.
//!
//! These calls go straight to the store under the configured deadline; they
//! never pass through the main loop.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

use crate::resilience::retry::Backoff;
use crate::store::{get_or_empty, with_deadline, ChangeEvent, Node, StoreError, WatchFeed};
use crate::tree::{to_value, Value};
use crate::types::RoomMeta;

use super::{Coordinator, CoordinatorError};

impl Coordinator {
    /// Read one key of a room. A missing key reads as `(Null, 0)`.
    pub async fn get(&self, room: &RoomMeta, key: &str) -> Result<(Value, u64), CoordinatorError> {
        self.check_room(room)?;
        let _timer = self.telemetry.timer("get");
        let store_key = self.keys.store_key(room, key);
        match with_deadline(self.config.store_timeout(), self.store.get(&store_key, true)).await {
            Ok(read) => Ok(to_value(&read.node)?),
            Err(e) if e.is_not_found() => Ok((Value::Null, 0)),
            Err(e) => {
                self.telemetry.error("get", e.kind());
                Err(e.into())
            }
        }
    }

    /// Read a whole room. A room with no data reads as an empty object at version 0.
    pub async fn get_all(&self, room: &RoomMeta) -> Result<(Value, u64), CoordinatorError> {
        self.check_room(room)?;
        let _timer = self.telemetry.timer("get_all");
        let read = get_or_empty(self.store.as_ref(), &self.keys.room_key(room), self.config.store_timeout())
            .await
            .inspect_err(|e| self.telemetry.error("get_all", e.kind()))?;
        Ok(to_value(&read.node)?)
    }

    /// Write `value` at `key` inside `room`, with an optional TTL on the leaf.
    ///
    /// The room directory's TTL is refreshed first. When the directory does not
    /// exist yet the leaf is written anyway (creating it) and the refresh is
    /// repeated, so a leaf never outlives a room directory without a TTL. Any
    /// other refresh failure aborts the write.
    ///
    /// Returns the modified index of the written leaf.
    pub async fn set(
        &self,
        room: &RoomMeta,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<u64, CoordinatorError> {
        self.check_room(room)?;
        if key.trim_matches('/').is_empty() {
            return Err(CoordinatorError::EmptyKey);
        }
        let _timer = self.telemetry.timer("set");
        let room_key = self.keys.room_key(room);
        let leaf_key = self.keys.store_key(room, key);
        let raw = value.to_json_string()?;
        let timeout = self.config.store_timeout();
        let room_ttl = self.config.room_ttl();

        let bootstrap = match with_deadline(timeout, self.store.refresh_ttl(&room_key, room_ttl)).await {
            Ok(_) => false,
            Err(e) if e.is_not_found() => true,
            Err(e) => return Err(self.failed("refresh", e)),
        };

        let written = with_deadline(timeout, self.store.set_with_ttl(&leaf_key, &raw, ttl))
            .await
            .map_err(|e| self.failed("set", e))?;

        if bootstrap {
            debug!(room = %room, "Room directory created, refreshing its TTL");
            with_deadline(timeout, self.store.refresh_ttl(&room_key, room_ttl))
                .await
                .map_err(|e| self.failed("refresh", e))?;
        }
        Ok(written.node.modified_index)
    }

    /// Every room present under `namespace`, with the store index of the read.
    pub async fn rooms_in(&self, namespace: &str) -> Result<(Vec<RoomMeta>, u64), CoordinatorError> {
        self.check_namespace(namespace)?;
        let read = get_or_empty(
            self.store.as_ref(),
            &self.keys.namespace_key(namespace),
            self.config.store_timeout(),
        )
        .await
        .inspect_err(|e| self.telemetry.error("rooms_in", e.kind()))?;

        let mut rooms = Vec::new();
        collect_rooms(&read.node, 0, &mut |node| {
            if let Some(meta) = self.keys.room_meta(&node.key) {
                rooms.push(meta);
            }
        });
        rooms.sort();
        Ok((rooms, read.index))
    }

    /// Stream the identity of every room in `namespace` that changes after
    /// `after_index` into `out`.
    ///
    /// Room-level only: leaf changes are not decoded. When the store can no
    /// longer resume from the last index, every room currently in the
    /// namespace is sent and the watch continues from the index of that
    /// listing, so no change is ever skipped (some may be reported twice).
    /// Runs until `cancel` fires or `out` is closed.
    pub async fn watch(
        &self,
        namespace: &str,
        after_index: u64,
        out: mpsc::Sender<RoomMeta>,
        cancel: CancellationToken,
    ) -> Result<(), CoordinatorError> {
        self.check_namespace(namespace)?;
        let span = info_span!(parent: self.telemetry.span(), "namespace_watch", namespace);
        let feed = WatchFeed::new(
            self.store.clone(),
            self.keys.namespace_key(namespace),
            self.config.store_timeout(),
            self.config.watch_retry(),
            self.telemetry.child("watch", span),
        );
        let inner = cancel.child_token();
        let (tx, mut rx) = mpsc::channel::<ChangeEvent>(self.config.room_channel_size);

        let produce = async {
            let mut after = after_index;
            let mut backoff = Backoff::new(self.config.watch_retry());
            'watch: loop {
                match feed.watch(after, &tx, &inner).await {
                    Ok(()) => break,
                    Err(e) => {
                        info!(namespace, error = %e, "Namespace watch invalidated, relisting rooms");
                        self.telemetry.event("index_cleared");
                    }
                }

                // Relist until it succeeds, then replay every room
                let (rooms, index) = loop {
                    match self.rooms_in(namespace).await {
                        Ok(listing) => break listing,
                        Err(e) => {
                            warn!(namespace, error = %e, "Failed to list rooms, retrying");
                            let delay = backoff.next_delay();
                            tokio::select! {
                                biased;
                                _ = inner.cancelled() => break 'watch,
                                _ = sleep(delay) => {}
                            }
                        }
                    }
                };
                backoff.reset();
                for room in rooms {
                    if !forward(&out, room, &inner).await {
                        break 'watch;
                    }
                }
                after = index;
            }
            inner.cancel();
        };

        let relay = async {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = inner.cancelled() => break,
                    event = rx.recv() => event,
                };
                let Some(event) = event else { break };
                match self.keys.room_meta(&event.node.key) {
                    Some(room) => {
                        if !forward(&out, room, &inner).await {
                            inner.cancel();
                            break;
                        }
                    }
                    None => debug!(key = %event.node.key, "Change above room level"),
                }
            }
        };

        tokio::join!(produce, relay);
        Ok(())
    }

    fn check_room(&self, room: &RoomMeta) -> Result<(), CoordinatorError> {
        if room.is_valid() {
            Ok(())
        } else {
            Err(CoordinatorError::InvalidRoom(room.clone()))
        }
    }

    fn check_namespace(&self, namespace: &str) -> Result<(), CoordinatorError> {
        if RoomMeta::new(namespace, "_").is_valid() {
            Ok(())
        } else {
            Err(CoordinatorError::InvalidNamespace(namespace.to_string()))
        }
    }

    fn failed(&self, operation: &str, err: StoreError) -> CoordinatorError {
        self.telemetry.error(operation, err.kind());
        err.into()
    }
}

/// Visit the nodes at room depth (namespace / shard / shard / room).
fn collect_rooms(node: &Node, depth: usize, visit: &mut impl FnMut(&Node)) {
    if depth == 3 {
        visit(node);
        return;
    }
    for child in node.nodes.iter().filter(|n| n.dir) {
        collect_rooms(child, depth + 1, visit);
    }
}

async fn forward(out: &mpsc::Sender<RoomMeta>, room: RoomMeta, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        res = out.send(room) => res.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomSyncConfig;
    use crate::metrics::Telemetry;
    use crate::store::{ExternalStore, MemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::timeout;

    fn coordinator(store: Arc<MemoryStore>) -> Coordinator {
        let config = RoomSyncConfig {
            watch_retry_min_ms: 1,
            watch_retry_max_ms: 5,
            ..Default::default()
        };
        Coordinator::new(store, config, Telemetry::disabled("coordinator")).unwrap()
    }

    fn json(raw: &str) -> Value {
        Value::from_json_str(raw).unwrap()
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(store.clone());
        let room = RoomMeta::new("ns", "r1");

        let index = c.set(&room, "a/b", &json("10"), None).await.unwrap();
        c.set(&room, "c", &json(r#"{"d": true}"#), None).await.unwrap();

        assert_eq!(c.get(&room, "a/b").await.unwrap(), (json("10"), index));
        let (all, version) = c.get_all(&room).await.unwrap();
        assert_eq!(all, json(r#"{"a": {"b": 10}, "c": {"d": true}}"#));
        assert_eq!(version, store.index());
    }

    #[tokio::test]
    async fn test_missing_reads() {
        let c = coordinator(Arc::new(MemoryStore::new()));
        let room = RoomMeta::new("ns", "nothing");
        assert_eq!(c.get(&room, "x").await.unwrap(), (Value::Null, 0));
        assert_eq!(c.get_all(&room).await.unwrap(), (Value::object(), 0));
    }

    #[tokio::test]
    async fn test_set_bootstraps_room_directory_ttl() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(store.clone());
        let room = RoomMeta::new("ns", "r1");

        c.set(&room, "a", &json("1"), None).await.unwrap();
        let dir = store.get(&c.keys().room_key(&room), false).await.unwrap();
        assert_eq!(dir.node.ttl, Some(c.config().room_ttl()));
    }

    #[tokio::test]
    async fn test_set_rejects_empty_key_and_bad_room() {
        let c = coordinator(Arc::new(MemoryStore::new()));
        let room = RoomMeta::new("ns", "r1");
        assert!(matches!(c.set(&room, "", &json("1"), None).await, Err(CoordinatorError::EmptyKey)));
        assert!(matches!(
            c.set(&RoomMeta::new("ns", "a/b"), "k", &json("1"), None).await,
            Err(CoordinatorError::InvalidRoom(_))
        ));
    }

    #[tokio::test]
    async fn test_set_aborts_on_conflict() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(store.clone());
        let room = RoomMeta::new("ns", "r1");
        c.set(&room, "a", &json("1"), None).await.unwrap();

        let err = c.set(&room, "a/b", &json("2"), None).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Store(StoreError::Conflict { .. })));
        assert!(!err.is_transient());
    }

    /// Store whose TTL refreshes always fail with `error`.
    struct RefreshFails {
        inner: MemoryStore,
        error: StoreError,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl ExternalStore for RefreshFails {
        async fn get(&self, key: &str, recursive: bool) -> Result<ChangeEvent, StoreError> {
            self.inner.get(key, recursive).await
        }

        async fn set_with_ttl(
            &self,
            key: &str,
            value: &str,
            ttl: Option<Duration>,
        ) -> Result<ChangeEvent, StoreError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set_with_ttl(key, value, ttl).await
        }

        async fn refresh_ttl(&self, _key: &str, _ttl: Duration) -> Result<ChangeEvent, StoreError> {
            Err(self.error.clone())
        }

        async fn watch_next(&self, key: &str, after_index: u64) -> Result<ChangeEvent, StoreError> {
            self.inner.watch_next(key, after_index).await
        }
    }

    #[tokio::test]
    async fn test_set_aborts_when_refresh_fails() {
        for error in [
            StoreError::Backend("connection refused".into()),
            StoreError::Timeout(Duration::from_millis(5)),
        ] {
            let store = Arc::new(RefreshFails {
                inner: MemoryStore::new(),
                error: error.clone(),
                writes: AtomicUsize::new(0),
            });
            let c = Coordinator::new(store.clone(), RoomSyncConfig::default(), Telemetry::disabled("coordinator")).unwrap();
            let room = RoomMeta::new("ns", "r1");

            let err = c.set(&room, "a", &json("1"), None).await.unwrap_err();
            assert!(matches!(&err, CoordinatorError::Store(e) if *e == error));
            assert_eq!(store.writes.load(Ordering::SeqCst), 0);
            assert!(store.inner.get(&c.keys().store_key(&room, "a"), false).await.unwrap_err().is_not_found());
        }
    }

    #[tokio::test]
    async fn test_rooms_in_lists_namespace() {
        let store = Arc::new(MemoryStore::new());
        let c = coordinator(store.clone());
        for id in ["r2", "r1", "r3"] {
            c.set(&RoomMeta::new("ns", id), "k", &json("1"), None).await.unwrap();
        }
        c.set(&RoomMeta::new("other", "r9"), "k", &json("1"), None).await.unwrap();

        let (rooms, index) = c.rooms_in("ns").await.unwrap();
        let ids: Vec<_> = rooms.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r1", "r2", "r3"]);
        assert_eq!(index, store.index());

        let (empty, _) = c.rooms_in("nobody").await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_watch_reports_changed_rooms() {
        let store = Arc::new(MemoryStore::new());
        let c = Arc::new(coordinator(store.clone()));
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = {
            let c = c.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { c.watch("ns", 0, tx, cancel).await })
        };

        c.set(&RoomMeta::new("ns", "r1"), "a", &json("1"), None).await.unwrap();
        c.set(&RoomMeta::new("other", "r2"), "a", &json("1"), None).await.unwrap();
        c.set(&RoomMeta::new("ns", "r3"), "a/b", &json("1"), None).await.unwrap();

        let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, RoomMeta::new("ns", "r1"));
        assert_eq!(second, RoomMeta::new("ns", "r3"));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_watch_relists_after_index_cleared() {
        let store = Arc::new(MemoryStore::with_history_limit(2));
        let c = coordinator(store.clone());
        for id in ["r1", "r2", "r3"] {
            c.set(&RoomMeta::new("ns", id), "a", &json("1"), None).await.unwrap();
        }

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let watch = c.watch("ns", 0, tx, cancel.clone());
        let collect = async {
            let mut seen = Vec::new();
            while seen.len() < 3 {
                seen.push(rx.recv().await.unwrap().id);
            }
            cancel.cancel();
            seen
        };
        let (result, mut seen) = timeout(Duration::from_secs(2), async { tokio::join!(watch, collect) })
            .await
            .unwrap();
        result.unwrap();
        seen.sort();
        assert_eq!(seen, vec!["r1", "r2", "r3"]);
    }
}
