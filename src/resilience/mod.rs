//! Resilience primitives shared by watch feeds, the coordinator and the syncer.

pub mod retry;
