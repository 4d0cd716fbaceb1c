// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Versioned replica of one store subtree.

use crate::store::{Action, ChangeEvent};
use crate::tree::{del_by_path, set_by_path, subkey, to_value, Value};

use super::RoomError;

/// The state a room actor owns: the reconstructed tree and the index of the
/// last change applied to it.
///
/// `version` never decreases. Changes at or below it are ignored, which makes
/// applying the same event twice (or an old one late) harmless.
#[derive(Debug, Clone, PartialEq)]
pub struct Replica {
    key: String,
    value: Value,
    version: u64,
}

impl Replica {
    /// Empty replica of the subtree rooted at `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Value::Null,
            version: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Apply one store event.
    ///
    /// Returns `Ok(true)` when the replica changed, `Ok(false)` when the event
    /// was stale. On error the replica is left as it was.
    ///
    /// A `get` received once the replica holds data is a re-read and is
    /// judged by the larger of its node indices and the store index of the
    /// read.
    pub fn apply_change(&mut self, event: &ChangeEvent) -> Result<bool, RoomError> {
        let path = subkey(&self.key, &event.node.key)?;
        let (value, index) = to_value(&event.node)?;
        // Deletes never raise a directory's index, so a re-read after lost
        // history counts as of the store index it was taken at.
        let index = match event.action {
            Action::Get if self.version > 0 => index.max(event.index),
            _ => index,
        };
        if index <= self.version {
            return Ok(false);
        }

        match &event.action {
            Action::Get => self.value = value,
            Action::Create | Action::Set | Action::Update => set_by_path(&mut self.value, path, value)?,
            Action::Delete | Action::Expire => del_by_path(&mut self.value, path)?,
            Action::Other(name) => return Err(RoomError::UnknownAction(name.clone())),
        }
        self.version = index;
        Ok(true)
    }
}
