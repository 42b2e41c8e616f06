//! The dead letter queue: capture, sweep, retry and replay.
//!
//! ## Record lifecycle
//!
//! - captured records are eligible immediately
//! - a sweep picks up every record that is due and not quarantined
//! - all handlers succeed: the record is removed
//! - a handler fails: `attempt_count` goes up, the error is appended to the
//!   retry history and the record is either scheduled for later or, once it
//!   reaches the attempt ceiling, quarantined
//! - a record already at the ceiling is quarantined by the next sweep or
//!   unforced retry without running handlers
//! - quarantined records are only attempted again by a forced retry
//!
//! Handler errors never escape as `Err`; store errors always do.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, info, warn};

use uno_core::{Clock, DlqError, DlqResult, HandlerId, RecordId, SystemClock};
use uno_events::{DeadLetterHandler, DeadLetterRecord, HandlerRegistry, NewDeadLetter};
use uno_observability::metrics::{self, MetricsSink, TracingMetricsSink};

use super::config::DlqConfig;
use super::locks::RecordLocks;
use super::policy::{BackoffPolicy, RetryPolicy};
use super::report::{
    DlqStats, ProcessOptions, ReplayReport, RetryOutcome, SkipReason, SweepReport,
};
use super::store::{DeadLetterStore, RecordFilter};

#[derive(Clone)]
struct PolicySettings {
    policy: Arc<dyn RetryPolicy>,
    max_attempts: u32,
}

/// Everything one attempt needs, resolved once per operation.
struct AttemptSettings {
    handlers: Vec<(HandlerId, Arc<dyn DeadLetterHandler>)>,
    policy: Arc<dyn RetryPolicy>,
    max_attempts: u32,
    retry_delay: Option<Duration>,
    handler_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptMode {
    /// Only if due; a missing record is skipped.
    Sweep,
    /// Regardless of due time; a missing record is an error.
    Manual { force: bool },
}

/// Dead letter orchestrator.
///
/// Owns no background task. Drive it with [`process`](Self::process), either
/// directly or through a [`SweepWorker`](crate::workers::SweepWorker).
pub struct DeadLetterQueue<S: DeadLetterStore> {
    store: S,
    handlers: HandlerRegistry,
    policy: RwLock<PolicySettings>,
    config: DlqConfig,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn Clock>,
    locks: RecordLocks,
}

impl<S: DeadLetterStore> DeadLetterQueue<S> {
    /// Create a queue over `store` with default configuration.
    pub fn new(store: S) -> Self {
        let config = DlqConfig::default();
        Self {
            store,
            handlers: HandlerRegistry::new(),
            policy: RwLock::new(PolicySettings {
                policy: Arc::new(BackoffPolicy::from_config(&config)),
                max_attempts: config.max_attempts,
            }),
            config,
            metrics: Arc::new(TracingMetricsSink),
            clock: Arc::new(SystemClock),
            locks: RecordLocks::new(),
        }
    }

    /// Replace the configuration. Also resets the retry policy to the
    /// backoff policy it describes.
    pub fn with_config(mut self, config: DlqConfig) -> Self {
        self.policy = RwLock::new(PolicySettings {
            policy: Arc::new(BackoffPolicy::from_config(&config)),
            max_attempts: config.max_attempts,
        });
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry_policy(self, policy: impl RetryPolicy + 'static, max_attempts: u32) -> Self {
        self.set_retry_policy(policy, max_attempts);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &DlqConfig {
        &self.config
    }

    /// Capture a failed event. Handlers are not invoked.
    pub async fn add(&self, capture: NewDeadLetter) -> DlqResult<RecordId> {
        let record = DeadLetterRecord::new(capture, self.clock.now());
        let id = record.id();
        let reason = record.reason();

        self.store.add(record).await?;
        self.emit(metrics::DEAD_LETTERED, reason.as_str());

        info!(record_id = %id, reason = %reason, "event dead-lettered");
        Ok(id)
    }

    /// Register a handler. Handlers run in registration order.
    pub fn add_handler(&self, handler: impl DeadLetterHandler + 'static) -> HandlerId {
        self.handlers.add(Arc::new(handler))
    }

    /// Unregister a handler. Returns `false` for an unknown token.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        self.handlers.remove(id)
    }

    /// Change the retry policy and attempt ceiling for subsequent attempts.
    ///
    /// Already scheduled `next_attempt_at` values are left as they are.
    pub fn set_retry_policy(&self, policy: impl RetryPolicy + 'static, max_attempts: u32) {
        let mut settings = self.policy.write().unwrap_or_else(|p| p.into_inner());
        *settings = PolicySettings {
            policy: Arc::new(policy),
            max_attempts,
        };
    }

    pub async fn get(&self, id: RecordId) -> DlqResult<Option<DeadLetterRecord>> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: &RecordFilter) -> DlqResult<Vec<DeadLetterRecord>> {
        self.store.list(filter).await
    }

    /// One sweep with the queue's own settings.
    pub async fn process(&self) -> DlqResult<SweepReport> {
        self.process_with(ProcessOptions::default()).await
    }

    /// One sweep over every due record.
    ///
    /// A failing record never stops the sweep. A store error does: it is
    /// returned and records already resolved stay resolved.
    pub async fn process_with(&self, options: ProcessOptions) -> DlqResult<SweepReport> {
        let settings = self.attempt_settings(&options);
        let now = self.clock.now();
        let due = self.store.list(&RecordFilter::due_at(now)).await?;

        let mut report = SweepReport {
            examined: due.len(),
            ..SweepReport::default()
        };

        if due.is_empty() {
            return Ok(report);
        }
        if settings.handlers.is_empty() {
            debug!(due = due.len(), "no dead letter handlers registered, sweep skipped");
            report.skipped = due.len();
            return Ok(report);
        }

        let max_concurrent = options
            .max_concurrent
            .unwrap_or(self.config.max_concurrent)
            .max(1);
        let settings = &settings;
        let options = &options;

        let mut attempts = futures::stream::iter(due.into_iter().map(|r| r.id()))
            .map(|id| async move {
                if options.should_stop() {
                    return Ok(RetryOutcome::Skipped(SkipReason::Cancelled));
                }
                self.attempt(id, AttemptMode::Sweep, settings).await
            })
            .buffer_unordered(max_concurrent);

        while let Some(outcome) = attempts.next().await {
            report.tally(&outcome?);
        }

        debug!(
            examined = report.examined,
            resolved = report.resolved,
            rescheduled = report.rescheduled,
            quarantined = report.quarantined,
            skipped = report.skipped,
            interrupted = report.interrupted,
            "dead letter sweep finished"
        );
        Ok(report)
    }

    /// Attempt one record now, ignoring its due time.
    ///
    /// Without `force`, a quarantined record is skipped. With `force` it is
    /// released and attempted; if it fails again while at or over the
    /// ceiling it goes straight back to quarantine.
    pub async fn retry(&self, id: RecordId, force: bool) -> DlqResult<RetryOutcome> {
        let settings = self.attempt_settings(&ProcessOptions::default());
        self.attempt(id, AttemptMode::Manual { force }, &settings)
            .await
    }

    /// [`retry`](Self::retry) every stored record, oldest first.
    pub async fn replay(&self, force: bool) -> DlqResult<ReplayReport> {
        let records = self.store.list(&RecordFilter::all()).await?;
        let mut report = ReplayReport::default();
        if records.is_empty() {
            return Ok(report);
        }

        let settings = self.attempt_settings(&ProcessOptions::default());
        for record in records {
            let id = record.id();
            let outcome = match self
                .attempt(id, AttemptMode::Manual { force }, &settings)
                .await
            {
                Ok(outcome) => outcome,
                Err(DlqError::RecordNotFound(_)) => RetryOutcome::Skipped(SkipReason::Gone),
                Err(e) => return Err(e),
            };
            report.push(id, outcome);
        }

        info!(
            records = report.summary.examined,
            resolved = report.summary.resolved,
            failed = report.summary.failed(),
            skipped = report.summary.skipped,
            force,
            "dead letter replay finished"
        );
        Ok(report)
    }

    /// Remove every record. Returns how many were removed.
    pub async fn clear(&self) -> DlqResult<usize> {
        let removed = self.store.clear().await?;
        info!(removed, "dead letter queue cleared");
        Ok(removed)
    }

    /// Records at the attempt ceiling count as quarantined even before a
    /// sweep has flagged them.
    pub async fn stats(&self) -> DlqResult<DlqStats> {
        let now = self.clock.now();
        let max_attempts = self
            .policy
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .max_attempts;
        let records = self.store.list(&RecordFilter::all()).await?;

        let mut stats = DlqStats {
            total: records.len(),
            ..DlqStats::default()
        };
        for record in &records {
            if record.is_quarantined() || record.attempt_count() >= max_attempts {
                stats.quarantined += 1;
            } else if record.is_due(now) {
                stats.eligible += 1;
            } else {
                stats.waiting += 1;
            }
            *stats
                .by_reason
                .entry(record.reason().as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }

    fn attempt_settings(&self, options: &ProcessOptions) -> AttemptSettings {
        let policy = self
            .policy
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        AttemptSettings {
            handlers: self.handlers.snapshot(),
            policy: policy.policy,
            max_attempts: options.max_attempts.unwrap_or(policy.max_attempts),
            retry_delay: options.retry_delay,
            handler_timeout: options.handler_timeout.or(self.config.handler_timeout),
        }
    }

    async fn attempt(
        &self,
        id: RecordId,
        mode: AttemptMode,
        settings: &AttemptSettings,
    ) -> DlqResult<RetryOutcome> {
        let _lease = self.locks.acquire(id).await;

        // Re-read under the lease: another sweep may have resolved or
        // rescheduled the record while we waited.
        let Some(record) = self.store.get(id).await? else {
            return match mode {
                AttemptMode::Sweep => Ok(RetryOutcome::Skipped(SkipReason::Gone)),
                AttemptMode::Manual { .. } => Err(DlqError::RecordNotFound(id)),
            };
        };

        let force = match mode {
            AttemptMode::Sweep => {
                if record.is_quarantined() {
                    return Ok(RetryOutcome::Skipped(SkipReason::Quarantined));
                }
                if record.attempt_count() >= settings.max_attempts {
                    return self.quarantine_exhausted(&record, settings).await;
                }
                if !record.is_due(self.clock.now()) {
                    return Ok(RetryOutcome::Skipped(SkipReason::NotDue));
                }
                false
            }
            AttemptMode::Manual { force } => {
                if record.is_quarantined() && !force {
                    debug!(record_id = %id, "quarantined dead letter not retried without force");
                    return Ok(RetryOutcome::Skipped(SkipReason::Quarantined));
                }
                if record.attempt_count() >= settings.max_attempts && !force {
                    return self.quarantine_exhausted(&record, settings).await;
                }
                force
            }
        };

        if settings.handlers.is_empty() {
            return Ok(RetryOutcome::Skipped(SkipReason::NoHandlers));
        }

        match self.run_handlers(&record, settings).await {
            Ok(()) => self.resolve(&record).await,
            Err(message) => self.fail(&record, message, force, settings).await,
        }
    }

    /// Run handlers in order; the first failure ends the attempt.
    async fn run_handlers(
        &self,
        record: &DeadLetterRecord,
        settings: &AttemptSettings,
    ) -> Result<(), String> {
        for (handler_id, handler) in &settings.handlers {
            let result = match settings.handler_timeout {
                Some(limit) => tokio::time::timeout(limit, handler.handle(record))
                    .await
                    .unwrap_or_else(|_| {
                        Err(anyhow::anyhow!(
                            "handler timed out after {}ms",
                            limit.as_millis()
                        ))
                    }),
                None => handler.handle(record).await,
            };

            if let Err(e) = result {
                let message = format!("{e:#}");
                warn!(
                    record_id = %record.id(),
                    handler = %handler_id,
                    attempt = record.attempt_count(),
                    error = %message,
                    "dead letter handler failed"
                );
                return Err(message);
            }
        }
        Ok(())
    }

    async fn resolve(&self, record: &DeadLetterRecord) -> DlqResult<RetryOutcome> {
        if !self.store.remove(record.id()).await? {
            debug!(record_id = %record.id(), "dead letter removed while being retried");
            return Ok(RetryOutcome::Skipped(SkipReason::Gone));
        }

        self.emit(metrics::PROCESSED, record.reason().as_str());
        info!(
            record_id = %record.id(),
            attempts = record.attempt_count(),
            "dead letter reprocessed"
        );
        Ok(RetryOutcome::Resolved {
            attempt_count: record.attempt_count(),
        })
    }

    /// A record already at the ceiling (captured there, or the ceiling was
    /// lowered) is quarantined without running handlers.
    async fn quarantine_exhausted(
        &self,
        record: &DeadLetterRecord,
        settings: &AttemptSettings,
    ) -> DlqResult<RetryOutcome> {
        let id = record.id();
        let now = self.clock.now();

        let mut apply = |r: &mut DeadLetterRecord| r.quarantine(now);
        match self.store.update(id, &mut apply).await {
            Ok(_) => {}
            Err(DlqError::RecordNotFound(_)) => {
                return Ok(RetryOutcome::Skipped(SkipReason::Gone));
            }
            Err(e) => return Err(e),
        }

        self.emit(metrics::QUARANTINED, record.reason().as_str());
        warn!(
            record_id = %id,
            attempts = record.attempt_count(),
            max_attempts = settings.max_attempts,
            "dead letter at attempt ceiling quarantined"
        );
        Ok(RetryOutcome::Skipped(SkipReason::Quarantined))
    }

    async fn fail(
        &self,
        record: &DeadLetterRecord,
        message: String,
        force: bool,
        settings: &AttemptSettings,
    ) -> DlqResult<RetryOutcome> {
        let id = record.id();
        let now = self.clock.now();

        let mut apply = |r: &mut DeadLetterRecord| {
            if force {
                r.release();
            }
            let count = r.record_failure(message.clone(), now);
            match next_attempt(settings, count, now) {
                Some(at) => r.schedule_next(at),
                None => r.quarantine(now),
            }
        };

        let updated = match self.store.update(id, &mut apply).await {
            Ok(updated) => updated,
            Err(DlqError::RecordNotFound(_)) => {
                debug!(record_id = %id, "dead letter removed while being retried");
                return Ok(RetryOutcome::Skipped(SkipReason::Gone));
            }
            Err(e) => return Err(e),
        };

        let reason = record.reason().as_str();
        self.emit(metrics::ERROR, reason);

        let quarantined = updated.is_quarantined();
        if quarantined {
            self.emit(metrics::QUARANTINED, reason);
            warn!(
                record_id = %id,
                attempts = updated.attempt_count(),
                "dead letter quarantined"
            );
        } else {
            self.emit(metrics::RETRY, reason);
            debug!(
                record_id = %id,
                attempts = updated.attempt_count(),
                next_attempt_at = ?updated.next_attempt_at(),
                "dead letter rescheduled"
            );
        }

        Ok(RetryOutcome::Failed {
            error: DlqError::handler(id, message),
            attempt_count: updated.attempt_count(),
            quarantined,
            next_attempt_at: if quarantined {
                None
            } else {
                updated.next_attempt_at()
            },
        })
    }

    fn emit(&self, name: &str, reason: &str) {
        if let Err(e) = self.metrics.increment(name, &[("reason", reason)]) {
            warn!(metric = name, error = %e, "failed to record metric");
        }
    }
}

/// When to try again after the `count`th attempt failed, or `None` to
/// quarantine.
fn next_attempt(
    settings: &AttemptSettings,
    count: u32,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if count >= settings.max_attempts {
        return None;
    }
    let policy_delay = settings.policy.next_delay(count)?;
    let delay = settings.retry_delay.unwrap_or(policy_delay);

    Some(
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    )
}

impl<S: DeadLetterStore> std::fmt::Debug for DeadLetterQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("handlers", &self.handlers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
