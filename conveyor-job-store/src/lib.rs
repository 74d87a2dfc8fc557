//! SQLite-backed job record store.
//!
//! [`SqlJobQueueStrategy`] implements [`JobQueueStrategy`](conveyor_job_queue::JobQueueStrategy)
//! on top of the `job_records` table. Several processes may poll the same
//! database; every transition that can race is a conditional `UPDATE`.

mod error;
pub mod queries;
mod row;
mod strategy;

pub use error::StoreError;
pub use row::JobRecordRow;
pub use strategy::{SqlJobQueueStrategy, DEFAULT_CLAIM_BATCH};
