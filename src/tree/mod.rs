// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tree algebra.
//!
//! Rebuilds a nested [`Value`] from the store's node format and applies
//! path-scoped set/delete mutations to it. Everything here is pure: no I/O,
//! no logging, errors are returned to the caller.

mod node;
mod path;
mod value;

pub use node::to_value;
pub use path::{del_by_path, set_by_path, subkey};
pub use value::Value;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("key '{key}' is outside of '{prefix}'")]
    KeyOutsidePrefix { prefix: String, key: String },
    #[error("cannot descend into {found} at '{path}'")]
    TypeConflict { path: String, found: &'static str },
    #[error("invalid JSON leaf at '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode value: {0}")]
    Encode(#[source] serde_json::Error),
}
