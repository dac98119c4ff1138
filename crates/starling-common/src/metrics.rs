//! Fire-and-forget metrics sink.
//!
//! The connection layer and pipeline record counters and gauges through this
//! trait; the server binary provides the real (Prometheus) implementation.
//! Updates must never block or fail the caller.

use std::sync::Arc;

pub trait MetricsSink: Send + Sync {
    /// Increment a named counter.
    fn counter(&self, name: &'static str, value: u64);

    /// Adjust a named gauge by a signed delta.
    fn gauge(&self, name: &'static str, delta: i64);
}

/// Sink that drops every update. Default for tests and embedded use.
#[derive(Debug, Default)]
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn counter(&self, _name: &'static str, _value: u64) {}
    fn gauge(&self, _name: &'static str, _delta: i64) {}
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

pub mod names {
    //! Metric names shared between recorders and the exporter.
    pub const CONNECTIONS_OPEN: &str = "starling_connections_open";
    pub const MESSAGES_RECEIVED: &str = "starling_messages_received_total";
    pub const EVENTS_ACCEPTED: &str = "starling_events_accepted_total";
    pub const EVENTS_REJECTED: &str = "starling_events_rejected_total";
    pub const SUBSCRIPTIONS_OPEN: &str = "starling_subscriptions_open";
    pub const RATE_LIMIT_HITS: &str = "starling_rate_limit_hits_total";
}
