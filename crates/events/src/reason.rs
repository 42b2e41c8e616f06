use serde::{Deserialize, Serialize};

/// Why an event ended up in the dead letter queue.
///
/// Set once when the record is created and never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterReason {
    /// A subscribed handler returned an error.
    HandlerFailed,
    /// A handler did not finish in time.
    Timeout,
    /// The event could not be decoded or failed validation.
    InvalidEvent,
    /// No handler was subscribed for the event.
    Unhandled,
    /// Anything else.
    Unknown,
}

impl DeadLetterReason {
    pub const ALL: [DeadLetterReason; 5] = [
        Self::HandlerFailed,
        Self::Timeout,
        Self::InvalidEvent,
        Self::Unhandled,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HandlerFailed => "HANDLER_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::InvalidEvent => "INVALID_EVENT",
            Self::Unhandled => "UNHANDLED",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid dead letter reason '{0}'; expected one of HANDLER_FAILED, TIMEOUT, INVALID_EVENT, UNHANDLED, UNKNOWN")]
pub struct ParseReasonError(pub String);

impl std::str::FromStr for DeadLetterReason {
    type Err = ParseReasonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == normalized)
            .ok_or_else(|| ParseReasonError(s.to_string()))
    }
}
