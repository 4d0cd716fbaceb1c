//! Public types for the room coordinator.

use thiserror::Error;

use crate::config::ConfigError;
use crate::store::StoreError;
use crate::tree::TreeError;
use crate::types::RoomMeta;

/// Coordinator lifecycle state.
///
/// Use [`super::Coordinator::state()`] to check the current state or
/// [`super::Coordinator::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Just created, not yet started
    Created,
    /// Main loop running
    Running,
    /// Loop exited, every room stopped
    Stopped,
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The bounded join/leave channel is full; retry later.
    #[error("{0} queue is full")]
    Backpressure(&'static str),
    #[error("coordinator is stopped")]
    Stopped,
    #[error("invalid room '{0}'")]
    InvalidRoom(RoomMeta),
    #[error("invalid namespace '{0}'")]
    InvalidNamespace(String),
    #[error("a leaf key is required")]
    EmptyKey,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tree(#[from] TreeError),
}

impl CoordinatorError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            CoordinatorError::Backpressure(_) => true,
            CoordinatorError::Store(e) => !matches!(e, StoreError::Conflict { .. } | StoreError::InvalidTtl { .. }),
            _ => false,
        }
    }
}
