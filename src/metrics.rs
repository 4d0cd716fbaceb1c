// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for room-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `room_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `component`: coordinator, room, watch, syncer
//! - `operation`: get, set, refresh, watch, sink, ...
//! - `kind`: error category
//!
//! Components never reach for a global logger or registry of their own: a
//! [`Telemetry`] value is handed to each constructor and carries the label and
//! the tracing span the component logs under.

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};
use tracing::Span;

/// Logging and metrics context injected into coordinator, rooms, watch feeds
/// and the syncer.
#[derive(Debug, Clone)]
pub struct Telemetry {
    component: &'static str,
    span: Span,
}

impl Telemetry {
    /// Root context for a component, logging under `span`.
    pub fn new(component: &'static str, span: Span) -> Self {
        Self { component, span }
    }

    /// Context that logs nowhere in particular; handy for tests and tools.
    pub fn disabled(component: &'static str) -> Self {
        Self::new(component, Span::none())
    }

    /// Derive a context for a sub-component with its own span.
    pub fn child(&self, component: &'static str, span: Span) -> Self {
        Self { component, span }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn error(&self, operation: &str, kind: &str) {
        record_error(self.component, operation, kind);
    }

    pub fn event(&self, operation: &str) {
        record_event(self.component, operation);
    }

    pub fn timer(&self, operation: &'static str) -> LatencyTimer {
        LatencyTimer::new(self.component, operation)
    }
}

/// Record a categorized error for alerting
pub fn record_error(component: &str, operation: &str, kind: &str) {
    counter!(
        "room_sync_errors_total",
        "component" => component.to_string(),
        "operation" => operation.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a notable non-error event (stale drop, index invalidation, ...)
pub fn record_event(component: &str, operation: &str) {
    counter!(
        "room_sync_events_total",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "room_sync_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// ROOMS - Lifecycle and fan-out
// ═══════════════════════════════════════════════════════════════════════════

/// Set number of rooms held by the coordinator
pub fn set_active_rooms(count: usize) {
    gauge!("room_sync_active_rooms").set(count as f64);
}

/// Record room creation or eviction
pub fn record_room_lifecycle(transition: &'static str) {
    counter!(
        "room_sync_room_lifecycle_total",
        "transition" => transition
    )
    .increment(1);
}

/// Record a change applied to a room replica
pub fn record_change_applied(action: &str) {
    counter!(
        "room_sync_changes_applied_total",
        "action" => action.to_string()
    )
    .increment(1);
}

/// Record a broadcast and how many connections it reached
pub fn record_broadcast(connections: usize) {
    counter!("room_sync_broadcasts_total").increment(1);
    counter!("room_sync_emissions_total").increment(connections as u64);
}

/// Record an emission dropped because a subscriber queue was full or closed
pub fn record_emission_dropped(reason: &'static str) {
    counter!(
        "room_sync_emissions_dropped_total",
        "reason" => reason
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNCER - Durable log
// ═══════════════════════════════════════════════════════════════════════════

/// Record a persisted snapshot (or a duplicate absorbed by the unique index)
pub fn record_sink(duplicate: bool) {
    let outcome = if duplicate { "duplicate" } else { "inserted" };
    counter!(
        "room_sync_records_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// Set syncer dirty-room queue depth
pub fn set_sync_queue_depth(depth: usize) {
    gauge!("room_sync_sync_queue_depth").set(depth as f64);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}
