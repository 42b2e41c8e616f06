//! Counter sinks.
//!
//! The dead letter queue only ever increments named counters, optionally
//! tagged. Sinks may fail; callers log the failure and carry on.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use ::tracing::debug;

/// An event was captured into the dead letter queue.
pub const DEAD_LETTERED: &str = "event.dead_lettered";
/// A failed reprocessing attempt was scheduled for another try.
pub const RETRY: &str = "event.dead_letter.retry";
/// A dead letter was successfully reprocessed and removed.
pub const PROCESSED: &str = "event.dead_letter.processed";
/// A reprocessing attempt failed.
pub const ERROR: &str = "event.dead_letter.error";
/// A dead letter exhausted its retry budget.
pub const QUARANTINED: &str = "event.dead_letter.quarantined";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics backend unavailable: {0}")]
    Unavailable(String),

    #[error("metric '{name}' rejected: {reason}")]
    Rejected { name: String, reason: String },
}

/// Destination for counter increments.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, tags: &[(&str, &str)]) -> Result<(), MetricsError>;
}

impl<M> MetricsSink for Arc<M>
where
    M: MetricsSink + ?Sized,
{
    fn increment(&self, name: &str, tags: &[(&str, &str)]) -> Result<(), MetricsError> {
        (**self).increment(name, tags)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _tags: &[(&str, &str)]) -> Result<(), MetricsError> {
        Ok(())
    }
}

/// Emits each increment as a `debug` tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn increment(&self, name: &str, tags: &[(&str, &str)]) -> Result<(), MetricsError> {
        debug!(metric = name, tags = ?tags, "counter incremented");
        Ok(())
    }
}

type CounterKey = (String, Vec<(String, String)>);

/// Process-local counters, keyed by name and (sorted) tags.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<BTreeMap<CounterKey, u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn key(name: &str, tags: &[(&str, &str)]) -> CounterKey {
        let mut tags: Vec<(String, String)> = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        tags.sort();
        (name.to_string(), tags)
    }

    /// Value of the counter with exactly these tags.
    pub fn count(&self, name: &str, tags: &[(&str, &str)]) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        counters.get(&Self::key(name, tags)).copied().unwrap_or(0)
    }

    /// Sum of the counter across all tag combinations.
    pub fn total(&self, name: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        counters
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, v)| *v)
            .sum()
    }

    /// Totals per counter name.
    pub fn totals(&self) -> BTreeMap<String, u64> {
        let counters = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        let mut out = BTreeMap::new();
        for ((name, _), value) in counters.iter() {
            *out.entry(name.clone()).or_insert(0) += value;
        }
        out
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, tags: &[(&str, &str)]) -> Result<(), MetricsError> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| MetricsError::Unavailable("counter lock poisoned".to_string()))?;
        *counters.entry(Self::key(name, tags)).or_insert(0) += 1;
        Ok(())
    }
}
