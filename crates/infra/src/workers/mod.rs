//! Background workers.

pub mod sweep_worker;

pub use sweep_worker::{SweepWorker, SweepWorkerHandle, SweepWorkerStats};
