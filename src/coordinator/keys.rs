// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Room identity <-> store path mapping.
//!
//! ```text
//! {prefix}/{namespace}/{h0h1}/{h2h3}/{id}[/{leaf key}]
//! ```
//!
//! `h0..h3` are the first four hex digits of SHA-256(id). The two shard levels
//! keep any single store directory from holding more than 256 children per
//! level, whatever the number of rooms in a namespace.

use sha2::{Digest, Sha256};

use crate::types::RoomMeta;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMapper {
    prefix: String,
}

impl KeyMapper {
    /// Mapper rooted at `prefix` (an absolute path without trailing `/`).
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Directory holding every room of `namespace`.
    #[must_use]
    pub fn namespace_key(&self, namespace: &str) -> String {
        format!("{}/{}", self.prefix, namespace)
    }

    /// Directory mirrored by the room.
    #[must_use]
    pub fn room_key(&self, room: &RoomMeta) -> String {
        let (a, b) = shard(&room.id);
        format!("{}/{}/{}/{}/{}", self.prefix, room.namespace, a, b, room.id)
    }

    /// Absolute key of `key` inside the room; the empty key is the room itself.
    #[must_use]
    pub fn store_key(&self, room: &RoomMeta, key: &str) -> String {
        let key = key.trim_matches('/');
        if key.is_empty() {
            self.room_key(room)
        } else {
            format!("{}/{}", self.room_key(room), key)
        }
    }

    /// Recover the room an absolute store key belongs to.
    ///
    /// `None` for keys outside the prefix, keys above room level and keys whose
    /// shard segments do not match the id.
    #[must_use]
    pub fn room_meta(&self, store_key: &str) -> Option<RoomMeta> {
        let rest = store_key.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        let mut parts = rest.splitn(5, '/');
        let namespace = parts.next()?;
        let a = parts.next()?;
        let b = parts.next()?;
        let id = parts.next()?;

        let room = RoomMeta::new(namespace, id);
        if !room.is_valid() || shard(id) != (a.to_string(), b.to_string()) {
            return None;
        }
        Some(room)
    }
}

fn shard(id: &str) -> (String, String) {
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    (digest[0..2].to_string(), digest[2..4].to_string())
}
