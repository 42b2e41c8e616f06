//! Options and results of queue operations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use uno_core::{DlqError, RecordId};

/// Cooperative stop signal for a running sweep.
///
/// Checked before each record is started; records already in flight finish.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    cancelled: Arc<AtomicBool>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Per-sweep overrides. Unset fields fall back to the queue's settings.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Attempt ceiling for this sweep.
    pub max_attempts: Option<u32>,
    /// Fixed delay before the next attempt, instead of asking the policy.
    pub retry_delay: Option<Duration>,
    pub max_concurrent: Option<usize>,
    pub handler_timeout: Option<Duration>,
    /// Records not started by this instant are left for the next sweep.
    pub deadline: Option<Instant>,
    pub cancellation: Option<Cancellation>,
}

impl ProcessOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(Cancellation::is_cancelled)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Why a record was left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Failed-Terminal and not forced.
    Quarantined,
    /// Its next attempt is scheduled for later.
    NotDue,
    NoHandlers,
    /// Removed by someone else before it could be attempted.
    Gone,
    /// The sweep was cancelled or ran past its deadline.
    Cancelled,
}

/// Result of attempting one record.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// Every handler succeeded; the record was removed.
    Resolved { attempt_count: u32 },
    /// A handler failed or timed out; the failure was recorded.
    Failed {
        error: DlqError,
        attempt_count: u32,
        quarantined: bool,
        next_attempt_at: Option<DateTime<Utc>>,
    },
    Skipped(SkipReason),
}

impl RetryOutcome {
    /// Whether handlers were actually invoked.
    pub fn attempted(&self) -> bool {
        !matches!(self, Self::Skipped(_))
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Records that were due when the sweep started.
    pub examined: usize,
    pub resolved: usize,
    /// Failed and scheduled for another attempt.
    pub rescheduled: usize,
    /// Failed and moved to Failed-Terminal.
    pub quarantined: usize,
    pub skipped: usize,
    /// Stopped early by cancellation or deadline.
    pub interrupted: bool,
}

impl SweepReport {
    pub(crate) fn tally(&mut self, outcome: &RetryOutcome) {
        match outcome {
            RetryOutcome::Resolved { .. } => self.resolved += 1,
            RetryOutcome::Failed {
                quarantined: true, ..
            } => self.quarantined += 1,
            RetryOutcome::Failed { .. } => self.rescheduled += 1,
            RetryOutcome::Skipped(reason) => {
                self.skipped += 1;
                if *reason == SkipReason::Cancelled {
                    self.interrupted = true;
                }
            }
        }
    }

    /// Records whose handlers ran.
    pub fn attempted(&self) -> usize {
        self.resolved + self.rescheduled + self.quarantined
    }

    pub fn failed(&self) -> usize {
        self.rescheduled + self.quarantined
    }
}

/// Result of a replay: the totals plus each record's outcome, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    pub summary: SweepReport,
    pub outcomes: Vec<(RecordId, RetryOutcome)>,
}

impl ReplayReport {
    pub(crate) fn push(&mut self, id: RecordId, outcome: RetryOutcome) {
        self.summary.examined += 1;
        self.summary.tally(&outcome);
        self.outcomes.push((id, outcome));
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DlqStats {
    pub total: usize,
    /// Due now and not quarantined.
    pub eligible: usize,
    /// Scheduled for a later attempt.
    pub waiting: usize,
    pub quarantined: usize,
    /// Record count per reason code.
    pub by_reason: BTreeMap<String, usize>,
}
