//! Dead letter error model.

use thiserror::Error;

use crate::id::RecordId;

/// Result type used across the dead letter crates.
pub type DlqResult<T> = Result<T, DlqError>;

/// Dead letter pipeline error.
///
/// Store-level variants (`StoreUnavailable`, `DuplicateRecord`,
/// `RecordNotFound`) describe infrastructure or caller mistakes and are
/// propagated. `HandlerExecution` describes a business failure inside a
/// handler; the queue absorbs it into the attempt counter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DlqError {
    /// `update`/`retry` targeted an id that is not in the store.
    #[error("no such dead letter: {0}")]
    RecordNotFound(RecordId),

    /// `add` collided with an existing id.
    #[error("dead letter already exists: {0}")]
    DuplicateRecord(RecordId),

    /// The backing store could not be reached or is in an unusable state.
    #[error("dead letter store unavailable: {0}")]
    StoreUnavailable(String),

    /// A registered handler failed (returned an error or timed out).
    #[error("handler failed for dead letter {record_id}: {message}")]
    HandlerExecution { record_id: RecordId, message: String },

    /// Configuration could not be accepted.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A persisted snapshot or payload could not be encoded/decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DlqError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    pub fn handler(record_id: RecordId, msg: impl Into<String>) -> Self {
        Self::HandlerExecution {
            record_id,
            message: msg.into(),
        }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// True for errors that come from the backing store rather than from
    /// handler code.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            Self::RecordNotFound(_)
                | Self::DuplicateRecord(_)
                | Self::StoreUnavailable(_)
                | Self::Serialization(_)
        )
    }
}

impl From<serde_json::Error> for DlqError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
