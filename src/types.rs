// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared identity types.

use serde::{Deserialize, Serialize};

/// Stable identity of a replication topic.
///
/// Used as the key of the coordinator's room table and mapped
/// deterministically onto a store directory (see
/// [`KeyMapper`](crate::coordinator::KeyMapper)).
///
/// # Example
///
/// ```
/// use room_sync::RoomMeta;
///
/// let room = RoomMeta::new("dashboards", "ops-overview");
/// assert!(room.is_valid());
/// assert_eq!(room.to_string(), "dashboards/ops-overview");
///
/// assert!(!RoomMeta::new("dashboards", "a/b").is_valid());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomMeta {
    pub namespace: String,
    pub id: String,
}

impl RoomMeta {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }

    /// Both parts must be non-empty single path segments.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        is_segment(&self.namespace) && is_segment(&self.id)
    }
}

impl std::fmt::Display for RoomMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

fn is_segment(s: &str) -> bool {
    !s.is_empty() && !s.contains('/') && s != "." && s != ".."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_meta_validation() {
        assert!(RoomMeta::new("ns", "room-1").is_valid());
        assert!(!RoomMeta::new("", "room-1").is_valid());
        assert!(!RoomMeta::new("ns", "").is_valid());
        assert!(!RoomMeta::new("ns/x", "room").is_valid());
        assert!(!RoomMeta::new("ns", "..").is_valid());
    }

    #[test]
    fn test_room_meta_serde() {
        let room = RoomMeta::new("ns", "r1");
        let json = serde_json::to_string(&room).unwrap();
        assert_eq!(json, r#"{"namespace":"ns","id":"r1"}"#);
        let back: RoomMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, room);
    }
}
