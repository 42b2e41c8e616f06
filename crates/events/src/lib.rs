//! Dead-lettered events: the record model and the handler contract.

pub mod handler;
pub mod reason;
pub mod record;

pub use handler::{DeadLetterHandler, HandlerRegistry, handler_fn, sync_handler};
pub use reason::{DeadLetterReason, ParseReasonError};
pub use record::{DeadLetterRecord, NewDeadLetter, RetryError, meta};
