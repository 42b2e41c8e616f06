//! The dead letter record: one failed event occurrence plus its bookkeeping.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use uno_core::RecordId;

use crate::reason::DeadLetterReason;

/// Metadata keys owned by the queue.
///
/// Callers may read them but cannot set them when capturing a dead letter.
pub mod meta {
    /// RFC 3339 time of the most recent reprocessing attempt.
    pub const LAST_ATTEMPT_AT: &str = "last_attempt_at";
    /// RFC 3339 time before which the record is not swept again.
    pub const NEXT_ATTEMPT_AT: &str = "next_attempt_at";
    /// Array of `{attempt, error, at}` objects, one per failed reprocessing.
    pub const RETRY_ERRORS: &str = "retry_errors";
    /// `true` once the record exhausted its retry budget.
    pub const QUARANTINED: &str = "quarantined";
    /// RFC 3339 time the record was quarantined.
    pub const QUARANTINED_AT: &str = "quarantined_at";

    pub const RESERVED: [&str; 5] = [
        LAST_ATTEMPT_AT,
        NEXT_ATTEMPT_AT,
        RETRY_ERRORS,
        QUARANTINED,
        QUARANTINED_AT,
    ];

    pub fn is_reserved(key: &str) -> bool {
        RESERVED.contains(&key)
    }
}

/// One failed reprocessing attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryError {
    /// Value of `attempt_count` after this failure.
    pub attempt: u32,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// A failed event, captured for inspection and redelivery.
///
/// `id`, `event_data`, `reason`, `error`, `timestamp` and `subscription_id`
/// never change after creation. Only `attempt_count` (upwards) and
/// `metadata` (keys added, never removed) move, and only through the
/// mutation helpers below, which the store applies inside `update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    id: RecordId,
    event_data: JsonValue,
    reason: DeadLetterReason,
    error: Option<String>,
    timestamp: DateTime<Utc>,
    subscription_id: Option<String>,
    #[serde(deserialize_with = "at_least_one")]
    attempt_count: u32,
    #[serde(default)]
    metadata: BTreeMap<String, JsonValue>,
}

fn at_least_one<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    u32::deserialize(deserializer).map(|n| n.max(1))
}

impl DeadLetterRecord {
    /// Build a fresh record from a capture request.
    ///
    /// A fresh id is assigned; `attempt_count` is clamped to at least 1.
    pub fn new(capture: NewDeadLetter, now: DateTime<Utc>) -> Self {
        let NewDeadLetter {
            event_data,
            reason,
            error,
            subscription_id,
            attempt_count,
            metadata,
        } = capture;

        Self {
            id: RecordId::new(),
            event_data,
            reason,
            error,
            timestamp: now,
            subscription_id,
            attempt_count: attempt_count.max(1),
            metadata,
        }
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn event_data(&self) -> &JsonValue {
        &self.event_data
    }

    pub fn reason(&self) -> DeadLetterReason {
        self.reason
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription_id.as_deref()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn metadata(&self) -> &BTreeMap<String, JsonValue> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&JsonValue> {
        self.metadata.get(key)
    }

    fn timestamp_meta(&self, key: &str) -> Option<DateTime<Utc>> {
        self.metadata
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp_meta(meta::LAST_ATTEMPT_AT)
    }

    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp_meta(meta::NEXT_ATTEMPT_AT)
    }

    pub fn quarantined_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp_meta(meta::QUARANTINED_AT)
    }

    /// Failed-Terminal: excluded from sweeps until a forced retry.
    pub fn is_quarantined(&self) -> bool {
        matches!(self.metadata.get(meta::QUARANTINED), Some(JsonValue::Bool(true)))
    }

    /// Errors from failed reprocessing attempts, oldest first.
    pub fn retry_errors(&self) -> Vec<RetryError> {
        self.metadata
            .get(meta::RETRY_ERRORS)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Whether a sweep at `now` should pick this record up.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.is_quarantined() {
            return false;
        }
        self.next_attempt_at().is_none_or(|at| now >= at)
    }

    /// Count one failed reprocessing attempt and append its error to the
    /// history. Returns the new attempt count.
    pub fn record_failure(&mut self, error: impl Into<String>, at: DateTime<Utc>) -> u32 {
        self.attempt_count = self.attempt_count.saturating_add(1);

        let entry = RetryError {
            attempt: self.attempt_count,
            error: error.into(),
            at,
        };
        let history = self
            .metadata
            .entry(meta::RETRY_ERRORS.to_string())
            .or_insert_with(|| JsonValue::Array(Vec::new()));
        match history {
            JsonValue::Array(items) => items.push(json_of(&entry)),
            other => *other = JsonValue::Array(vec![json_of(&entry)]),
        }

        self.set_timestamp_meta(meta::LAST_ATTEMPT_AT, at);
        self.attempt_count
    }

    /// Note a reprocessing attempt that did not fail (used before a record
    /// is removed, or when a handler chain is cut short by cancellation).
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.set_timestamp_meta(meta::LAST_ATTEMPT_AT, at);
    }

    /// Hold the record back from sweeps until `at`.
    pub fn schedule_next(&mut self, at: DateTime<Utc>) {
        self.set_timestamp_meta(meta::NEXT_ATTEMPT_AT, at);
    }

    /// Move to Failed-Terminal.
    pub fn quarantine(&mut self, at: DateTime<Utc>) {
        self.metadata
            .insert(meta::QUARANTINED.to_string(), JsonValue::Bool(true));
        self.set_timestamp_meta(meta::QUARANTINED_AT, at);
    }

    /// Lift the Failed-Terminal flag (forced retry).
    pub fn release(&mut self) {
        if self.metadata.contains_key(meta::QUARANTINED) {
            self.metadata
                .insert(meta::QUARANTINED.to_string(), JsonValue::Bool(false));
        }
    }

    /// Add or overwrite a contextual tag. Keys are never removed.
    pub fn insert_metadata(&mut self, key: impl Into<String>, value: JsonValue) {
        self.metadata.insert(key.into(), value);
    }

    fn set_timestamp_meta(&mut self, key: &str, at: DateTime<Utc>) {
        self.metadata.insert(key.to_string(), json_of(&at));
    }
}

fn json_of<T: Serialize>(value: &T) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

/// A capture request: what the failing pipeline knows about the failure.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeadLetter {
    event_data: JsonValue,
    reason: DeadLetterReason,
    error: Option<String>,
    subscription_id: Option<String>,
    attempt_count: u32,
    metadata: BTreeMap<String, JsonValue>,
}

impl NewDeadLetter {
    pub fn new(event_data: JsonValue, reason: DeadLetterReason) -> Self {
        Self {
            event_data,
            reason,
            error: None,
            subscription_id: None,
            attempt_count: 1,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_subscription_id(mut self, subscription_id: impl Into<String>) -> Self {
        self.subscription_id = Some(subscription_id.into());
        self
    }

    /// Attempts already made before capture. Values below 1 become 1.
    pub fn with_attempt_count(mut self, attempt_count: u32) -> Self {
        self.attempt_count = attempt_count.max(1);
        self
    }

    /// Attach a contextual tag. Keys reserved for the queue are ignored.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        let key = key.into();
        if meta::is_reserved(&key) {
            warn!(key = %key, "ignoring reserved dead letter metadata key");
            return self;
        }
        self.metadata.insert(key, value.into());
        self
    }

    pub fn reason(&self) -> DeadLetterReason {
        self.reason
    }
}
