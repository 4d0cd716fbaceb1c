// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process hierarchical store.
//!
//! Behaves like the remote store the coordinator talks to in production:
//! strictly increasing indices, implicit parent directories, TTLs that expire
//! into `expire` events, and a bounded event history. A watcher that falls
//! behind the retained history gets [`StoreError::IndexCleared`].
//!
//! Expiry is evaluated lazily on every call, and watchers wake up at the next
//! deadline, so tests can drive TTLs with a paused tokio clock.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use super::traits::{Action, ChangeEvent, ExternalStore, Node, StoreError};

/// Events kept for watchers before older ones are cleared.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
struct Entry {
    /// `None` for directories.
    value: Option<String>,
    created_index: u64,
    modified_index: u64,
    ttl: Option<Duration>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_dir(&self) -> bool {
        self.value.is_none()
    }

    fn to_node(&self, key: &str) -> Node {
        Node {
            key: key.to_string(),
            value: self.value.clone().unwrap_or_default(),
            dir: self.is_dir(),
            nodes: Vec::new(),
            created_index: self.created_index,
            modified_index: self.modified_index,
            ttl: self.ttl,
        }
    }
}

#[derive(Debug)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    index: u64,
    history: VecDeque<ChangeEvent>,
    history_limit: usize,
    /// Index of the newest event dropped from `history`.
    cleared_through: u64,
}

impl Inner {
    fn record(&mut self, event: ChangeEvent) {
        if self.history.len() >= self.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.cleared_through = dropped.index;
            }
        }
        self.history.push_back(event);
    }

    fn remove_subtree(&mut self, key: &str) {
        let below = format!("{key}/");
        self.entries.retain(|k, _| k != key && !k.starts_with(&below));
    }

    /// Drop every entry whose TTL has passed, emitting one `expire` event per
    /// expired key. Returns whether anything expired.
    fn purge_expired(&mut self, now: Instant) -> bool {
        let expired: Vec<(String, Entry)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();

        let mut any = false;
        for (key, entry) in expired {
            // Already removed together with an expired ancestor
            if !self.entries.contains_key(&key) {
                continue;
            }
            self.remove_subtree(&key);
            self.index += 1;
            let mut node = entry.to_node(&key);
            node.value.clear();
            node.modified_index = self.index;
            let event = ChangeEvent {
                action: Action::Expire,
                node,
                index: self.index,
            };
            self.record(event);
            any = true;
        }
        any
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.expires_at).min()
    }

    fn children<'a>(&'a self, key: &'a str) -> impl Iterator<Item = (&'a String, &'a Entry)> + 'a {
        let below = format!("{key}/");
        self.entries
            .range(below.clone()..)
            .take_while(move |(k, _)| k.starts_with(&below))
            .filter(move |(k, _)| !k[key.len() + 1..].contains('/'))
    }

    fn build(&self, key: &str, entry: &Entry, recursive: bool, depth: usize) -> Node {
        let mut node = entry.to_node(key);
        if entry.is_dir() && (recursive || depth == 0) {
            node.nodes = self
                .children(key)
                .map(|(k, child)| {
                    if recursive {
                        self.build(k, child, true, depth + 1)
                    } else {
                        child.to_node(k)
                    }
                })
                .collect();
        }
        node
    }
}

/// Thread-safe in-memory [`ExternalStore`].
///
/// # Example
///
/// ```
/// use room_sync::store::{ExternalStore, MemoryStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new();
/// store.set("/rooms/ns/a", "1").await.unwrap();
/// let read = store.get("/rooms", true).await.unwrap();
/// assert!(read.node.dir);
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    notify: watch::Sender<u64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Store retaining at most `limit` events for watchers (minimum 1).
    #[must_use]
    pub fn with_history_limit(limit: usize) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                index: 0,
                history: VecDeque::new(),
                history_limit: limit.max(1),
                cleared_through: 0,
            }),
            notify,
        }
    }

    /// Current store-wide index.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.inner.lock().index
    }

    /// Remove `key`; directories require `recursive`.
    pub fn delete(&self, key: &str, recursive: bool) -> Result<ChangeEvent, StoreError> {
        let key = normalize(key)?;
        let event = {
            let mut inner = self.inner.lock();
            inner.purge_expired(Instant::now());
            let entry = inner.entries.get(&key).cloned().ok_or_else(|| StoreError::NotFound {
                key: key.clone(),
                index: inner.index,
            })?;
            if entry.is_dir() && !recursive {
                return Err(StoreError::Conflict {
                    key,
                    reason: "is a directory",
                });
            }
            inner.remove_subtree(&key);
            inner.index += 1;
            let mut node = entry.to_node(&key);
            node.value.clear();
            node.modified_index = inner.index;
            let event = ChangeEvent {
                action: Action::Delete,
                node,
                index: inner.index,
            };
            inner.record(event.clone());
            event
        };
        self.wake(event.index);
        Ok(event)
    }

    fn wake(&self, index: u64) {
        self.notify.send_replace(index);
    }
}

#[async_trait]
impl ExternalStore for MemoryStore {
    async fn get(&self, key: &str, recursive: bool) -> Result<ChangeEvent, StoreError> {
        let key = normalize(key)?;
        let mut inner = self.inner.lock();
        let expired = inner.purge_expired(Instant::now());
        let index = inner.index;
        let result = match inner.entries.get(&key) {
            Some(entry) => Ok(ChangeEvent {
                action: Action::Get,
                node: inner.build(&key, entry, recursive, 0),
                index,
            }),
            None => Err(StoreError::NotFound { key, index }),
        };
        drop(inner);
        if expired {
            self.wake(index);
        }
        result
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<ChangeEvent, StoreError> {
        let key = normalize(key)?;
        let now = Instant::now();
        let event = {
            let mut inner = self.inner.lock();
            inner.purge_expired(now);

            if inner.entries.get(&key).is_some_and(Entry::is_dir) {
                return Err(StoreError::Conflict {
                    key,
                    reason: "is a directory",
                });
            }
            let parents = ancestors(&key);
            if let Some(leaf) = parents
                .iter()
                .find(|p| inner.entries.get(p.as_str()).is_some_and(|e| !e.is_dir()))
            {
                return Err(StoreError::Conflict {
                    key: leaf.clone(),
                    reason: "not a directory",
                });
            }

            inner.index += 1;
            let index = inner.index;
            for parent in parents {
                inner.entries.entry(parent).or_insert(Entry {
                    value: None,
                    created_index: index,
                    modified_index: index,
                    ttl: None,
                    expires_at: None,
                });
            }
            let created_index = inner.entries.get(&key).map_or(index, |e| e.created_index);
            let entry = Entry {
                value: Some(value.to_string()),
                created_index,
                modified_index: index,
                ttl,
                expires_at: ttl.map(|ttl| now + ttl),
            };
            let event = ChangeEvent {
                action: Action::Set,
                node: entry.to_node(&key),
                index,
            };
            inner.entries.insert(key, entry);
            inner.record(event.clone());
            event
        };
        self.wake(event.index);
        Ok(event)
    }

    async fn refresh_ttl(&self, key: &str, ttl: Duration) -> Result<ChangeEvent, StoreError> {
        let key = normalize(key)?;
        if ttl.is_zero() {
            return Err(StoreError::InvalidTtl { key });
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired = inner.purge_expired(now);
        let index = inner.index + 1;
        let node = inner.entries.get_mut(&key).map(|entry| {
            entry.ttl = Some(ttl);
            entry.expires_at = Some(now + ttl);
            entry.modified_index = index;
            entry.to_node(&key)
        });
        let result = match node {
            Some(node) => {
                inner.index = index;
                Ok(ChangeEvent {
                    action: Action::Update,
                    node,
                    index,
                })
            }
            None => Err(StoreError::NotFound {
                key,
                index: inner.index,
            }),
        };
        let current = inner.index;
        drop(inner);
        // Refreshes are silent; only expiries that happened on the way wake watchers
        if expired {
            self.wake(current);
        }
        result
    }

    async fn watch_next(&self, key: &str, after_index: u64) -> Result<ChangeEvent, StoreError> {
        let key = normalize(key)?;
        let below = format!("{key}/");
        loop {
            let (mut changed, deadline) = {
                let mut inner = self.inner.lock();
                let expired = inner.purge_expired(Instant::now());
                if after_index < inner.cleared_through {
                    return Err(StoreError::IndexCleared { index: inner.index });
                }
                let found = inner
                    .history
                    .iter()
                    .find(|ev| {
                        ev.index > after_index
                            && (ev.node.key == key || ev.node.key.starts_with(&below))
                    })
                    .cloned();
                if expired {
                    self.notify.send_replace(inner.index);
                }
                if let Some(event) = found {
                    return Ok(event);
                }
                (self.notify.subscribe(), inner.next_deadline())
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        res = changed.changed() => res.map_err(|e| StoreError::Backend(e.to_string()))?,
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => changed
                    .changed()
                    .await
                    .map_err(|e| StoreError::Backend(e.to_string()))?,
            }
        }
    }
}

/// Trim a trailing separator and reject keys that are not absolute paths.
fn normalize(key: &str) -> Result<String, StoreError> {
    let trimmed = key.trim_end_matches('/');
    if !trimmed.starts_with('/') || trimmed.split('/').skip(1).any(str::is_empty) {
        return Err(StoreError::Backend(format!("invalid key '{key}'")));
    }
    Ok(trimmed.to_string())
}

/// `/a/b/c` -> `["/a", "/a/b"]`
fn ancestors(key: &str) -> Vec<String> {
    key.match_indices('/')
        .skip(1)
        .map(|(i, _)| key[..i].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ancestors_and_normalize() {
        assert_eq!(ancestors("/a/b/c"), vec!["/a".to_string(), "/a/b".to_string()]);
        assert!(ancestors("/a").is_empty());
        assert_eq!(normalize("/a/b/").unwrap(), "/a/b");
        assert!(normalize("a/b").is_err());
        assert!(normalize("/a//b").is_err());
        assert!(normalize("/").is_err());
    }

    #[tokio::test]
    async fn test_set_creates_parent_dirs() {
        let store = MemoryStore::new();
        let ev = store.set("/r/ns/room/aaa", "1").await.unwrap();
        assert_eq!(ev.action, Action::Set);
        assert_eq!(ev.index, 1);

        let dir = store.get("/r/ns", false).await.unwrap();
        assert!(dir.node.dir);
        assert_eq!(dir.node.nodes.len(), 1);
        assert_eq!(dir.node.nodes[0].key, "/r/ns/room");
        // Non-recursive reads do not descend past the first level
        assert!(dir.node.nodes[0].nodes.is_empty());
    }

    #[tokio::test]
    async fn test_recursive_get_builds_subtree() {
        let store = MemoryStore::new();
        store.set("/r/room/aaa", "111").await.unwrap();
        store.set("/r/room/eee/fff", "333").await.unwrap();

        let ev = store.get("/r/room", true).await.unwrap();
        assert_eq!(ev.index, 2);
        let keys: Vec<_> = ev.node.nodes.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(keys, vec!["/r/room/aaa", "/r/room/eee"]);
        assert_eq!(ev.node.nodes[1].nodes[0].value, "333");
    }

    #[tokio::test]
    async fn test_get_missing_reports_index() {
        let store = MemoryStore::new();
        store.set("/x", "1").await.unwrap();
        let err = store.get("/missing", true).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound { key: "/missing".into(), index: 1 });
    }

    #[tokio::test]
    async fn test_conflicting_writes() {
        let store = MemoryStore::new();
        store.set("/a/b", "1").await.unwrap();
        assert!(matches!(store.set("/a", "2").await, Err(StoreError::Conflict { .. })));
        assert!(matches!(store.set("/a/b/c", "2").await, Err(StoreError::Conflict { .. })));
        assert_eq!(store.index(), 1);
    }

    #[tokio::test]
    async fn test_watch_returns_next_change_below_key() {
        let store = MemoryStore::new();
        store.set("/other/x", "0").await.unwrap();
        store.set("/r/a", "1").await.unwrap();
        store.set("/r/b", "2").await.unwrap();

        let ev = store.watch_next("/r", 0).await.unwrap();
        assert_eq!(ev.node.key, "/r/a");
        let ev = store.watch_next("/r", ev.index).await.unwrap();
        assert_eq!(ev.node.key, "/r/b");
    }

    #[tokio::test]
    async fn test_watch_blocks_until_write() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let watcher = {
            let store = store.clone();
            tokio::spawn(async move { store.watch_next("/r", 0).await })
        };
        tokio::task::yield_now().await;
        store.set("/r/a", "1").await.unwrap();
        let ev = watcher.await.unwrap().unwrap();
        assert_eq!(ev.node.value, "1");
    }

    #[tokio::test]
    async fn test_delete_recursive_emits_event() {
        let store = MemoryStore::new();
        store.set("/r/a/b", "1").await.unwrap();
        assert!(matches!(store.delete("/r/a", false), Err(StoreError::Conflict { .. })));
        let ev = store.delete("/r/a", true).unwrap();
        assert_eq!(ev.action, Action::Delete);
        assert!(ev.node.dir);
        assert!(store.get("/r/a/b", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_history_overflow_clears_index() {
        let store = MemoryStore::with_history_limit(2);
        for i in 0..4 {
            store.set(&format!("/r/k{i}"), "1").await.unwrap();
        }
        let err = store.watch_next("/r", 0).await.unwrap_err();
        assert_eq!(err, StoreError::IndexCleared { index: 4 });
        // Still inside the retained window
        assert_eq!(store.watch_next("/r", 2).await.unwrap().index, 3);
    }

    #[tokio::test]
    async fn test_refresh_is_silent_and_rejects_zero() {
        let store = MemoryStore::new();
        store.set("/r/a", "1").await.unwrap();
        assert!(store.refresh_ttl("/missing", Duration::from_secs(1)).await.unwrap_err().is_not_found());
        assert!(matches!(
            store.refresh_ttl("/r", Duration::ZERO).await,
            Err(StoreError::InvalidTtl { .. })
        ));
        let ev = store.refresh_ttl("/r", Duration::from_secs(60)).await.unwrap();
        assert_eq!(ev.index, 2);

        let pending = tokio::time::timeout(Duration::from_millis(20), store.watch_next("/r", 1)).await;
        assert!(pending.is_err(), "refresh must not wake watchers");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_emits_expire_event() {
        let store = MemoryStore::new();
        store.set_with_ttl("/r/a", "1", Some(Duration::from_secs(5))).await.unwrap();

        let ev = store.watch_next("/r", 1).await.unwrap();
        assert_eq!(ev.action, Action::Expire);
        assert_eq!(ev.node.key, "/r/a");
        assert_eq!(ev.index, 2);
        assert!(store.get("/r/a", false).await.unwrap_err().is_not_found());
    }
}
