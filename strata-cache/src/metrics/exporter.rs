//! Prometheus export of cache events
//!
//! Collectors are registered into a caller-owned [`Registry`] so several
//! systems (or several tests) can coexist in one process.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

use super::{CacheEvent, CacheObserver};

/// Records every cache event as Prometheus counters and histograms
#[derive(Clone)]
pub struct PrometheusObserver {
    /// Total operations by segment, operation and outcome
    ops_total: IntCounterVec,
    /// Operation latency in seconds
    op_duration: HistogramVec,
}

impl PrometheusObserver {
    /// Create the collectors and register them into `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let ops_total = IntCounterVec::new(
            Opts::new(
                "strata_cache_operations_total",
                "Total number of cache operations by segment, operation and outcome",
            ),
            &["segment", "operation", "outcome"],
        )?;

        let op_duration = HistogramVec::new(
            HistogramOpts::new(
                "strata_cache_operation_duration_seconds",
                "Cache operation latency in seconds",
            )
            .buckets(vec![0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0]),
            &["segment", "operation"],
        )?;

        registry.register(Box::new(ops_total.clone()))?;
        registry.register(Box::new(op_duration.clone()))?;

        Ok(Self {
            ops_total,
            op_duration,
        })
    }
}

impl CacheObserver for PrometheusObserver {
    fn on_event(&self, event: &CacheEvent) {
        let segment = event.segment.as_deref().unwrap_or("default");
        let operation = event.operation.as_str();

        self.ops_total
            .with_label_values(&[segment, operation, event.outcome.as_str()])
            .inc();
        self.op_duration
            .with_label_values(&[segment, operation])
            .observe(event.latency_ms / 1000.0);
    }
}

/// Encode all metrics of `registry` to Prometheus text format
pub fn encode_metrics(registry: &Registry) -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Operation, Outcome};
    use std::time::Duration;

    #[test]
    fn test_record_cache_events() {
        let registry = Registry::new();
        let observer = PrometheusObserver::new(&registry).unwrap();

        let mut event = CacheEvent::new(
            Operation::Get,
            "key1",
            Outcome::Hit,
            Duration::from_millis(2),
        );
        event.segment = Some("posts".to_string());
        observer.on_event(&event);
        observer.on_event(&CacheEvent::new(
            Operation::Set,
            "key1",
            Outcome::Ok,
            Duration::from_millis(1),
        ));

        let metrics = encode_metrics(&registry).unwrap();
        assert!(metrics.contains("strata_cache_operations_total"));
        assert!(metrics.contains("strata_cache_operation_duration_seconds"));
        assert!(metrics.contains("segment=\"posts\""));
        assert!(metrics.contains("segment=\"default\""));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        assert!(PrometheusObserver::new(&registry).is_ok());
        assert!(PrometheusObserver::new(&registry).is_err());
    }

    #[test]
    fn test_registries_are_independent() {
        let first = Registry::new();
        let second = Registry::new();
        assert!(PrometheusObserver::new(&first).is_ok());
        assert!(PrometheusObserver::new(&second).is_ok());
    }
}
