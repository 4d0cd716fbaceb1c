// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store abstraction: nodes, change events and the [`ExternalStore`] trait.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key not found: {key} (store index {index})")]
    NotFound { key: String, index: u64 },
    /// The requested watch index fell out of the store's event history.
    #[error("watch index cleared, store is at {index}")]
    IndexCleared { index: u64 },
    #[error("store request timed out after {0:?}")]
    Timeout(Duration),
    #[error("conflicting node at {key}: {reason}")]
    Conflict { key: String, reason: &'static str },
    #[error("refusing to refresh {key} with a zero TTL")]
    InvalidTtl { key: String },
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    #[must_use]
    pub fn is_index_cleared(&self) -> bool {
        matches!(self, StoreError::IndexCleared { .. })
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "not_found",
            StoreError::IndexCleared { .. } => "index_cleared",
            StoreError::Timeout(_) => "timeout",
            StoreError::Conflict { .. } => "conflict",
            StoreError::InvalidTtl { .. } => "invalid_ttl",
            StoreError::Backend(_) => "backend",
        }
    }
}

/// What happened to the node carried by a [`ChangeEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    Get,
    Create,
    Set,
    Update,
    Delete,
    Expire,
    /// Anything the replicas do not know how to apply (compareAndSwap, ...).
    Other(String),
}

impl Action {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Action::Get => "get",
            Action::Create => "create",
            Action::Set => "set",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Expire => "expire",
            Action::Other(name) => name,
        }
    }
}

impl From<&str> for Action {
    fn from(name: &str) -> Self {
        match name {
            "get" => Action::Get,
            "create" => Action::Create,
            "set" => Action::Set,
            "update" => Action::Update,
            "delete" => Action::Delete,
            "expire" => Action::Expire,
            other => Action::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node of the store's hierarchy, as returned by reads and watches.
///
/// Keys are absolute. Directory nodes carry their children in `nodes`
/// (populated recursively for recursive reads); leaves carry a raw JSON
/// string in `value`, empty for deletions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub key: String,
    pub value: String,
    pub dir: bool,
    pub nodes: Vec<Node>,
    pub created_index: u64,
    pub modified_index: u64,
    pub ttl: Option<Duration>,
}

impl Node {
    pub fn leaf(key: impl Into<String>, value: impl Into<String>, modified_index: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            modified_index,
            ..Default::default()
        }
    }

    pub fn dir(key: impl Into<String>, modified_index: u64) -> Self {
        Self {
            key: key.into(),
            dir: true,
            modified_index,
            ..Default::default()
        }
    }
}

/// One response from the store: a read result or a watched change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub action: Action,
    pub node: Node,
    /// Store-wide index at the time of the response; the resume point for a
    /// watch started after a read.
    pub index: u64,
}

impl ChangeEvent {
    /// Read result for a directory that does not exist (yet), so a watch can
    /// start from the index the store reported alongside the miss.
    pub fn empty_dir(key: impl Into<String>, index: u64) -> Self {
        Self {
            action: Action::Get,
            node: Node::dir(key, 0),
            index,
        }
    }
}

/// Remote hierarchical key-value store with per-key modification indices and
/// a long-poll watch primitive.
///
/// Implementations must be linearizable and hand out strictly increasing
/// modification indices. Reconnection logic lives in
/// [`WatchFeed`](super::WatchFeed), not here.
#[async_trait]
pub trait ExternalStore: Send + Sync {
    /// Read `key`; directories list their children, all descendants when `recursive`.
    async fn get(&self, key: &str, recursive: bool) -> Result<ChangeEvent, StoreError>;

    /// Write a leaf without TTL.
    async fn set(&self, key: &str, value: &str) -> Result<ChangeEvent, StoreError> {
        self.set_with_ttl(key, value, None).await
    }

    /// Write a leaf, creating parent directories implicitly.
    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<ChangeEvent, StoreError>;

    /// Push back the expiry of an existing key or directory without notifying watchers.
    async fn refresh_ttl(&self, key: &str, ttl: Duration) -> Result<ChangeEvent, StoreError>;

    /// Wait for the first change at or below `key` whose modified index is
    /// greater than `after_index`.
    ///
    /// Returns [`StoreError::IndexCleared`] when `after_index` is older than
    /// the store's retained history. Dropping the future abandons the wait.
    async fn watch_next(&self, key: &str, after_index: u64) -> Result<ChangeEvent, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_parse_round_trip() {
        for name in ["get", "create", "set", "update", "delete", "expire"] {
            let action = Action::from(name);
            assert!(!matches!(action, Action::Other(_)));
            assert_eq!(action.as_str(), name);
        }
        assert_eq!(Action::from("compareAndSwap"), Action::Other("compareAndSwap".into()));
    }

    #[test]
    fn test_error_classification() {
        let nf = StoreError::NotFound { key: "/a".into(), index: 3 };
        assert!(nf.is_not_found());
        assert!(!nf.is_index_cleared());
        assert!(StoreError::IndexCleared { index: 9 }.is_index_cleared());
        assert_eq!(StoreError::Timeout(Duration::from_secs(1)).kind(), "timeout");
    }

    #[test]
    fn test_empty_dir_event() {
        let ev = ChangeEvent::empty_dir("/rooms/x", 42);
        assert_eq!(ev.action, Action::Get);
        assert!(ev.node.dir);
        assert_eq!(ev.node.modified_index, 0);
        assert_eq!(ev.index, 42);
    }
}
