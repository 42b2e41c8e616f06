//! Dead letter queue with retry, backoff and quarantine.
//!
//! ## Design
//!
//! - Failed events are captured as records and kept until resolved or cleared
//! - Retry timing comes from a pure policy (`attempt -> delay | give up`)
//! - Records that exhaust their budget are quarantined, not dropped
//! - The store is injected; nothing here is a process-wide singleton
//!
//! ## Components
//!
//! - `DeadLetterStore`: persistence contract (in-memory or snapshot file)
//! - `RetryPolicy`: backoff decisions
//! - `DeadLetterQueue`: capture, sweep, retry, replay and stats
//! - `DlqConfig`: settings, loadable from the environment

pub mod config;
pub mod file_store;
mod locks;
pub mod policy;
pub mod queue;
pub mod report;
pub mod store;

pub use config::DlqConfig;
pub use file_store::FileDeadLetterStore;
pub use policy::{BackoffPolicy, BackoffStrategy, RetryPolicy};
pub use queue::DeadLetterQueue;
pub use report::{
    Cancellation, DlqStats, ProcessOptions, ReplayReport, RetryOutcome, SkipReason, SweepReport,
};
pub use store::{DeadLetterStore, InMemoryDeadLetterStore, RecordFilter};
