//! Infrastructure layer: dead letter storage, retry orchestration and the
//! background sweep worker.

pub mod dlq;
pub mod workers;

mod integration_tests;
