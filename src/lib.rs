//! # Room Sync
//!
//! Live replication of store subtrees ("rooms") to connected subscribers, with
//! a durable snapshot log on the side.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Coordinator                          │
//! │  • join / leave routed through one bounded main loop       │
//! │  • get / get_all / set straight to the store               │
//! │  • namespace watch (room-level change feed)                │
//! │  • periodic sweep evicts rooms without connections         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    (one actor per RoomMeta)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Room                              │
//! │  • WatchFeed: recursive get, then long-poll watch          │
//! │  • applies changes to an in-memory Value tree              │
//! │  • drops stale events (index <= version)                   │
//! │  • broadcasts full snapshots to every connection           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                  (namespace watch → get_all)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Syncer                             │
//! │  • persists snapshots to MySQL/SQLite                      │
//! │  • unique (cluster, version) makes retries idempotent      │
//! │  • resumes from the latest stored version                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use room_sync::{
//!     ChannelConnection, Coordinator, MemoryStore, RoomMeta, RoomSyncConfig, SqlSinker, Syncer,
//!     Telemetry,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RoomSyncConfig {
//!         sql_url: Some("sqlite:rooms.db?mode=rwc".into()),
//!         ..Default::default()
//!     };
//!     let telemetry = Telemetry::new("room_sync", tracing::info_span!("room_sync"));
//!
//!     let store = Arc::new(MemoryStore::new());
//!     let coordinator = Arc::new(
//!         Coordinator::new(store, config.clone(), telemetry.clone()).expect("Invalid config"),
//!     );
//!     coordinator.start();
//!
//!     // Persist every change in the "dashboards" namespace
//!     let sinker = Arc::new(SqlSinker::new(config.sql_url.as_deref().unwrap()).await.expect("Failed to connect"));
//!     let syncer = Syncer::new(coordinator.clone(), sinker, "dashboards", telemetry).expect("Invalid namespace");
//!     syncer.start();
//!
//!     // Subscribe a connection and write into its room
//!     let room = RoomMeta::new("dashboards", "ops");
//!     let (conn, mut emissions) = ChannelConnection::new("conn-1", vec![room.clone()], 64);
//!     coordinator.join(conn).expect("Queue full");
//!     coordinator.set(&room, "cpu/load", &0.75.into(), None).await.expect("Failed to set");
//!
//!     if let Some(emission) = emissions.recv().await {
//!         println!("v{}: {}", emission.version, emission.payload().unwrap());
//!     }
//!
//!     syncer.stop().await;
//!     coordinator.stop().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`Coordinator`] owning every room
//! - [`room`]: per-room replication actor
//! - [`tree`]: the [`Value`] tree and its path algebra
//! - [`store`]: the [`ExternalStore`] abstraction, [`MemoryStore`] and [`WatchFeed`]
//! - [`sync`]: the [`Syncer`] and its SQL sink
//! - [`connection`]: the subscriber side of a room
//! - [`resilience`]: retry and backoff

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod metrics;
pub mod resilience;
pub mod room;
pub mod store;
pub mod sync;
pub mod tree;
pub mod types;

pub use config::{ConfigError, RoomSyncConfig};
pub use connection::{ChannelConnection, Connection, Emission};
pub use coordinator::{Coordinator, CoordinatorError, CoordinatorState, KeyMapper};
pub use metrics::{LatencyTimer, Telemetry};
pub use resilience::retry::{Backoff, RetryConfig};
pub use room::{Room, RoomError, RoomState};
pub use store::{Action, ChangeEvent, ExternalStore, MemoryStore, Node, StoreError, WatchFeed};
pub use sync::{Change, Record, Sinker, SqlSinker, SyncError, Syncer};
pub use tree::{TreeError, Value};
pub use types::RoomMeta;
