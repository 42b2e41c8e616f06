//! Tracing and metrics for the dead letter pipeline.

/// Initialize process-wide tracing with the default `info` filter.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize tracing with `default_level` unless `RUST_LOG` is set.
pub fn init_with_level(default_level: &str) {
    tracing::init_with_level(default_level);
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Counter sinks.
pub mod metrics;

pub use metrics::{InMemoryMetrics, MetricsError, MetricsSink, NoopMetrics, TracingMetricsSink};
