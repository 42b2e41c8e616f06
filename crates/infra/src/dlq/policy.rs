//! Retry policies: when (and whether) a failed dead letter is tried again.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::DlqConfig;

/// Decides the delay before the next attempt.
///
/// `attempt` is the number of attempts already made. `None` means give up
/// for good, which is different from "not due yet". Implementations must be
/// pure functions of `attempt`; an attempt of 0 is treated as 1.
pub trait RetryPolicy: Send + Sync {
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

impl<F> RetryPolicy for F
where
    F: Fn(u32) -> Option<Duration> + Send + Sync,
{
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        self(attempt.max(1))
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^attempt
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            other => Err(format!(
                "unknown backoff strategy '{other}', expected fixed, exponential or linear"
            )),
        }
    }
}

/// Strategy-based policy with a delay cap and an attempt ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Attempts beyond this get no delay (give up).
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &DlqConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            strategy: config.strategy,
            jitter: config.jitter,
        }
    }

    /// Same delay after every failure.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        }
    }

    /// Retry immediately, up to `max_attempts`.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::fixed(max_attempts, Duration::ZERO)
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    fn raw_delay_ms(&self, attempt: u32) -> f64 {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => base_ms * 2_f64.powi(attempt.min(62) as i32),
            BackoffStrategy::Linear => base_ms * f64::from(attempt),
        };
        delay_ms.min(max_ms)
    }
}

impl RetryPolicy for BackoffPolicy {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        let attempt = attempt.max(1);
        if attempt > self.max_attempts {
            return None;
        }

        let delay_ms = self.raw_delay_ms(attempt);

        // Deterministic jitter derived from the attempt number keeps the
        // policy a pure function.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((f64::from(attempt) * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        let max_ms = self.max_delay.as_millis() as f64;
        Some(Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let policy =
            BackoffPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(60));

        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(400)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(800)));
        assert_eq!(policy.next_delay(5), Some(Duration::from_millis(3200)));
    }

    #[test]
    fn gives_up_beyond_max_attempts() {
        let policy = BackoffPolicy::default();
        assert!(policy.next_delay(5).is_some());
        assert_eq!(policy.next_delay(6), None);
    }

    #[test]
    fn attempt_zero_is_treated_as_one() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(0), policy.next_delay(1));

        let closure = |attempt: u32| Some(Duration::from_secs(u64::from(attempt)));
        assert_eq!(closure.next_delay(0), Some(Duration::from_secs(1)));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(4), None);
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = BackoffPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            ..Default::default()
        };

        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(300)));
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy::exponential(50, Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.next_delay(40), Some(Duration::from_secs(10)));
    }

    #[test]
    fn strategy_parses_from_text() {
        assert_eq!("Linear".parse::<BackoffStrategy>(), Ok(BackoffStrategy::Linear));
        assert!("sometimes".parse::<BackoffStrategy>().is_err());
    }

    proptest! {
        /// Same attempt, same answer; never above the cap; None only past the ceiling.
        #[test]
        fn policy_is_pure_and_bounded(
            attempt in 0u32..64,
            max_attempts in 1u32..20,
            base_ms in 0u64..5_000,
            jitter in 0.0f64..1.0,
        ) {
            let policy = BackoffPolicy::exponential(
                max_attempts,
                Duration::from_millis(base_ms),
                Duration::from_secs(60),
            )
            .with_jitter(jitter);

            let first = policy.next_delay(attempt);
            prop_assert_eq!(first, policy.next_delay(attempt));

            match first {
                Some(delay) => {
                    prop_assert!(attempt.max(1) <= max_attempts);
                    prop_assert!(delay <= Duration::from_secs(60));
                }
                None => prop_assert!(attempt.max(1) > max_attempts),
            }
        }
    }
}
