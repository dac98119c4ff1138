//! Prometheus-backed metrics sink and the `/metrics` exporter.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use starling_common::metrics::{MetricsSink, names};
use std::collections::HashMap;

pub struct PrometheusMetrics {
    registry: Registry,
    counters: HashMap<&'static str, IntCounter>,
    gauges: HashMap<&'static str, IntGauge>,
}

impl PrometheusMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let mut counters = HashMap::new();
        let mut gauges = HashMap::new();

        for (name, help) in [
            (names::MESSAGES_RECEIVED, "Frames received over all connections"),
            (names::EVENTS_ACCEPTED, "Events accepted by the pipeline"),
            (names::EVENTS_REJECTED, "Events rejected by the pipeline"),
            (names::RATE_LIMIT_HITS, "Operations refused by a rate limiter"),
        ] {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            counters.insert(name, counter);
        }

        for (name, help) in [
            (names::CONNECTIONS_OPEN, "Currently open WebSocket connections"),
            (names::SUBSCRIPTIONS_OPEN, "Currently open subscriptions"),
        ] {
            let gauge = IntGauge::new(name, help)?;
            registry.register(Box::new(gauge.clone()))?;
            gauges.insert(name, gauge);
        }

        Ok(Self {
            registry,
            counters,
            gauges,
        })
    }

    /// Render the registry in the Prometheus text format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn counter(&self, name: &'static str, value: u64) {
        if let Some(counter) = self.counters.get(name) {
            counter.inc_by(value);
        }
    }

    fn gauge(&self, name: &'static str, delta: i64) {
        if let Some(gauge) = self.gauges.get(name) {
            gauge.add(delta);
        }
    }
}
