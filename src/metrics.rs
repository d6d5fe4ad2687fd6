//! Prometheus metrics for the daemon.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::Mutex;

/// Metric handles plus the registry that encodes them.
#[derive(Debug)]
pub struct Metrics {
    registry: Mutex<Registry>,
    /// Seconds spent broadcasting owned counters to all peers, per cycle.
    pub broadcast_duration: Histogram,
    /// Seconds spent forwarding queued global hits to owners, per flush.
    pub global_send_duration: Histogram,
    /// Rate limit checks evaluated on this peer.
    pub check_counter: Counter,
    /// Checks that answered OVER_LIMIT.
    pub over_limit_counter: Counter,
    /// Counters currently cached.
    pub cache_size: Gauge,
}

impl Metrics {
    /// Create and register the daemon's metric set.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let broadcast_duration = Histogram::new(exponential_buckets(0.001, 2.0, 12));
        registry.register(
            "gubernator_broadcast_duration",
            "Time spent broadcasting global counters to peers",
            broadcast_duration.clone(),
        );

        let global_send_duration = Histogram::new(exponential_buckets(0.001, 2.0, 12));
        registry.register(
            "gubernator_global_send_duration",
            "Time spent forwarding global hits to owning peers",
            global_send_duration.clone(),
        );

        let check_counter = Counter::default();
        registry.register(
            "gubernator_getratelimit",
            "Rate limit checks evaluated locally",
            check_counter.clone(),
        );

        let over_limit_counter = Counter::default();
        registry.register(
            "gubernator_over_limit",
            "Rate limit checks answered OVER_LIMIT",
            over_limit_counter.clone(),
        );

        let cache_size = Gauge::default();
        registry.register(
            "gubernator_cache_size",
            "Counters currently held in the cache",
            cache_size.clone(),
        );

        Self {
            registry: Mutex::new(registry),
            broadcast_duration,
            global_send_duration,
            check_counter,
            over_limit_counter,
            cache_size,
        }
    }

    /// Render every metric in Prometheus text exposition format.
    #[must_use]
    pub fn encode_text(&self) -> String {
        let registry = self.registry.lock().expect("metrics registry lock poisoned");
        let mut out = String::new();
        if encode(&mut out, &registry).is_err() {
            out.clear();
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_series_are_exposed() {
        let metrics = Metrics::new();
        metrics.broadcast_duration.observe(0.004);
        metrics.broadcast_duration.observe(0.015);
        metrics.global_send_duration.observe(0.002);

        let text = metrics.encode_text();
        assert!(text.contains("gubernator_broadcast_duration_count 2"));
        assert!(text.contains("gubernator_global_send_duration_count 1"));
    }

    #[test]
    fn test_counters_and_gauge() {
        let metrics = Metrics::new();
        metrics.check_counter.inc();
        metrics.check_counter.inc_by(4);
        metrics.over_limit_counter.inc();
        metrics.cache_size.set(37);

        let text = metrics.encode_text();
        assert!(text.contains("gubernator_getratelimit_total 5"));
        assert!(text.contains("gubernator_over_limit_total 1"));
        assert!(text.contains("gubernator_cache_size 37"));
    }
}
