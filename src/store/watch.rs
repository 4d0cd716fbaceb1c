// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilient watch stream over an [`ExternalStore`] subtree.
//!
//! A [`WatchFeed`] turns the store's one-shot `watch_next` long-poll into an
//! unbounded stream of [`ChangeEvent`]s pushed into a bounded channel:
//!
//! - Transient store errors are logged, counted and retried with backoff.
//! - An invalidated watch index restarts from a fresh recursive read
//!   ([`WatchFeed::get_and_watch`]) or is handed back to the caller
//!   ([`WatchFeed::watch`]).
//! - Every await is raced against a [`CancellationToken`], so cancelling is
//!   immediate and may be done any number of times.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::traits::{ChangeEvent, ExternalStore, StoreError};
use super::get_or_empty;
use crate::metrics::Telemetry;
use crate::resilience::retry::{Backoff, RetryConfig};

pub struct WatchFeed {
    store: Arc<dyn ExternalStore>,
    key: String,
    timeout: Duration,
    retry: RetryConfig,
    telemetry: Telemetry,
}

impl WatchFeed {
    /// Feed for the subtree at `key`. `timeout` bounds each recursive read;
    /// the long-poll itself has no deadline.
    pub fn new(
        store: Arc<dyn ExternalStore>,
        key: impl Into<String>,
        timeout: Duration,
        retry: RetryConfig,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            timeout,
            retry,
            telemetry,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Send a recursive read of the subtree, then every change after it.
    ///
    /// A missing subtree is reported as an empty directory. On an invalidated
    /// watch index the feed starts over from a new read. Runs until `cancel`
    /// fires or the receiver goes away.
    pub async fn get_and_watch(&self, out: &mpsc::Sender<ChangeEvent>, cancel: &CancellationToken) {
        let mut backoff = Backoff::new(self.retry.clone());
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                res = get_or_empty(self.store.as_ref(), &self.key, self.timeout) => res,
            };

            let index = match read {
                Ok(snapshot) => {
                    backoff.reset();
                    let index = snapshot.index;
                    debug!(key = %self.key, index, "Read subtree");
                    if !send(out, snapshot, cancel).await {
                        return;
                    }
                    index
                }
                Err(err) => {
                    self.transient("get", &err, &backoff);
                    if !pause(&mut backoff, cancel).await {
                        return;
                    }
                    continue;
                }
            };

            match self.watch(index, out, cancel).await {
                Ok(()) => return,
                Err(err) => {
                    info!(key = %self.key, error = %err, "Watch index invalidated, resyncing");
                    self.telemetry.event("index_cleared");
                }
            }
        }
    }

    /// Send every change with an index greater than `after_index`.
    ///
    /// Returns `Ok(())` once cancelled or when the receiver goes away, and
    /// [`StoreError::IndexCleared`] when the store no longer holds the history
    /// needed to resume. Other errors are retried forever.
    pub async fn watch(
        &self,
        after_index: u64,
        out: &mpsc::Sender<ChangeEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let mut after = after_index;
        let mut backoff = Backoff::new(self.retry.clone());
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                res = self.store.watch_next(&self.key, after) => res,
            };

            match next {
                Ok(event) => {
                    backoff.reset();
                    after = after.max(event.index);
                    if !send(out, event, cancel).await {
                        return Ok(());
                    }
                }
                Err(err) if err.is_index_cleared() => return Err(err),
                Err(err) => {
                    self.transient("watch", &err, &backoff);
                    if !pause(&mut backoff, cancel).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn transient(&self, operation: &str, err: &StoreError, backoff: &Backoff) {
        warn!(
            key = %self.key,
            operation,
            error = %err,
            attempt = backoff.attempts() + 1,
            "Store request failed, retrying"
        );
        self.telemetry.error(operation, err.kind());
    }
}

/// Deliver one event unless cancelled first. `false` means stop.
async fn send(out: &mpsc::Sender<ChangeEvent>, event: ChangeEvent, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        res = out.send(event) => res.is_ok(),
    }
}

/// Sleep for the next backoff delay unless cancelled first. `false` means stop.
async fn pause(backoff: &mut Backoff, cancel: &CancellationToken) -> bool {
    let delay = backoff.next_delay();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Action, MemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn feed(store: Arc<dyn ExternalStore>, key: &str) -> WatchFeed {
        WatchFeed::new(
            store,
            key,
            Duration::from_secs(1),
            RetryConfig::unbounded(Duration::from_millis(1), Duration::from_millis(5)),
            Telemetry::disabled("watch"),
        )
    }

    #[tokio::test]
    async fn test_get_and_watch_reads_then_streams() {
        let store = Arc::new(MemoryStore::new());
        store.set("/r/room/aaa", "1").await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = {
            let feed = feed(store.clone(), "/r/room");
            let cancel = cancel.clone();
            tokio::spawn(async move { feed.get_and_watch(&tx, &cancel).await })
        };

        let first = rx.recv().await.unwrap();
        assert_eq!(first.action, Action::Get);
        assert_eq!(first.index, 1);

        store.set("/r/room/bbb", "2").await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.action, Action::Set);
        assert_eq!(second.node.key, "/r/room/bbb");

        cancel.cancel();
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_subtree_reads_as_empty_dir() {
        let store = Arc::new(MemoryStore::new());
        store.set("/elsewhere", "1").await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let feed = feed(store.clone(), "/r/room");
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { feed.get_and_watch(&tx, &cancel).await })
        };

        let first = rx.recv().await.unwrap();
        assert!(first.node.dir);
        assert!(first.node.nodes.is_empty());
        assert_eq!(first.index, 1);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_returns_index_cleared() {
        let store = Arc::new(MemoryStore::with_history_limit(1));
        store.set("/r/a", "1").await.unwrap();
        store.set("/r/b", "1").await.unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let err = feed(store, "/r")
            .watch(0, &tx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_index_cleared());
    }

    /// Fails the first few watch calls with a backend error, then delegates.
    struct Flaky {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl ExternalStore for Flaky {
        async fn get(&self, key: &str, recursive: bool) -> Result<ChangeEvent, StoreError> {
            self.inner.get(key, recursive).await
        }

        async fn set_with_ttl(
            &self,
            key: &str,
            value: &str,
            ttl: Option<Duration>,
        ) -> Result<ChangeEvent, StoreError> {
            self.inner.set_with_ttl(key, value, ttl).await
        }

        async fn refresh_ttl(&self, key: &str, ttl: Duration) -> Result<ChangeEvent, StoreError> {
            self.inner.refresh_ttl(key, ttl).await
        }

        async fn watch_next(&self, key: &str, after_index: u64) -> Result<ChangeEvent, StoreError> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Backend("connection reset".into()));
            }
            self.inner.watch_next(key, after_index).await
        }
    }

    #[tokio::test]
    async fn test_watch_retries_transient_errors() {
        let store = Arc::new(Flaky {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(3),
        });
        store.set("/r/a", "1").await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = {
            let feed = feed(store.clone(), "/r");
            let cancel = cancel.clone();
            tokio::spawn(async move { feed.watch(0, &tx, &cancel).await })
        };

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.node.key, "/r/a");
        assert_eq!(store.failures.load(Ordering::SeqCst), 0);

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }
}
