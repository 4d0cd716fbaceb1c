// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! External hierarchical store.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   get/set/refresh (deadline)   ┌─────────────────┐
//! │ Coordinator  │ ─────────────────────────────► │                 │
//! └──────────────┘                                │  ExternalStore  │
//! ┌──────────────┐   get + watch_next (retry)     │  (remote or     │
//! │ WatchFeed    │ ─────────────────────────────► │   MemoryStore)  │
//! └──────┬───────┘                                └─────────────────┘
//!        │ ChangeEvent (bounded mpsc)
//!        ▼
//!   Room actor / Syncer
//! ```

mod memory;
mod traits;
mod watch;

pub use memory::{MemoryStore, DEFAULT_HISTORY_LIMIT};
pub use traits::{Action, ChangeEvent, ExternalStore, Node, StoreError};
pub use watch::WatchFeed;

use std::future::Future;
use std::time::Duration;

/// Run a single store request under `timeout`.
pub async fn with_deadline<T, F>(timeout: Duration, request: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(timeout, request)
        .await
        .map_err(|_| StoreError::Timeout(timeout))?
}

/// Recursive read of `key` where a missing key reads as an empty directory
/// at the store index reported with the miss.
pub async fn get_or_empty(
    store: &dyn ExternalStore,
    key: &str,
    timeout: Duration,
) -> Result<ChangeEvent, StoreError> {
    match with_deadline(timeout, store.get(key, true)).await {
        Err(StoreError::NotFound { index, .. }) => Ok(ChangeEvent::empty_dir(key, index)),
        other => other,
    }
}
