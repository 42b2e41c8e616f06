//! Dead letter queue configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use uno_core::{DlqError, DlqResult};

use super::policy::BackoffStrategy;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);
const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Dead letter queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Attempts (including the original failure) before a record is quarantined.
    pub max_attempts: u32,
    /// Base delay fed to the backoff strategy.
    #[serde(with = "millis")]
    pub base_delay: Duration,
    /// Upper bound for any computed delay.
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
    /// Records processed concurrently within one sweep.
    pub max_concurrent: usize,
    /// Limit for a single handler invocation (`None` = unbounded).
    #[serde(with = "opt_millis")]
    pub handler_timeout: Option<Duration>,
    /// Interval used by the sweep worker.
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
            max_concurrent: 1,
            handler_timeout: Some(DEFAULT_HANDLER_TIMEOUT),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl DlqConfig {
    /// Load from `UNO_DLQ_*` environment variables, falling back to defaults.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(v) = parsed::<u32>(&lookup, "UNO_DLQ_MAX_ATTEMPTS") {
            config.max_attempts = v;
        }
        if let Some(v) = parsed::<u64>(&lookup, "UNO_DLQ_BASE_DELAY_MS") {
            config.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parsed::<u64>(&lookup, "UNO_DLQ_MAX_DELAY_MS") {
            config.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = parsed::<BackoffStrategy>(&lookup, "UNO_DLQ_STRATEGY") {
            config.strategy = v;
        }
        if let Some(v) = parsed::<f64>(&lookup, "UNO_DLQ_JITTER") {
            config.jitter = v;
        }
        if let Some(v) = parsed::<usize>(&lookup, "UNO_DLQ_MAX_CONCURRENT") {
            config.max_concurrent = v;
        }
        if let Some(v) = parsed::<u64>(&lookup, "UNO_DLQ_HANDLER_TIMEOUT_MS") {
            // 0 disables the timeout
            config.handler_timeout = (v > 0).then(|| Duration::from_millis(v));
        }
        if let Some(v) = parsed::<u64>(&lookup, "UNO_DLQ_SWEEP_INTERVAL_MS") {
            config.sweep_interval = Duration::from_millis(v);
        }

        config
    }

    pub fn validate(&self) -> DlqResult<()> {
        if self.max_attempts == 0 {
            return Err(DlqError::invalid_config("max_attempts must be at least 1"));
        }
        if self.max_concurrent == 0 {
            return Err(DlqError::invalid_config("max_concurrent must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(DlqError::invalid_config(format!(
                "jitter must be within 0.0..=1.0, got {}",
                self.jitter
            )));
        }
        if self.max_delay < self.base_delay {
            return Err(DlqError::invalid_config("max_delay must not be below base_delay"));
        }
        if self.sweep_interval.is_zero() {
            return Err(DlqError::invalid_config("sweep_interval must be positive"));
        }
        Ok(())
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring invalid configuration value");
            None
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|v| v.map(Duration::from_millis))
    }
}
