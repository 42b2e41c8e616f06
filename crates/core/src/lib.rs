//! `uno-core`: shared building blocks for the dead letter pipeline.
//!
//! This crate holds identifiers, the error taxonomy and the time source.
//! It has no storage or runtime concerns.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DlqError, DlqResult};
pub use id::{HandlerId, RecordId};
