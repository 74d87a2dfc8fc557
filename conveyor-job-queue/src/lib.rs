//! Durable background job queue.
//!
//! Jobs are JSON payloads added to named queues. A [`JobQueueStrategy`]
//! persists them and hands them out; a dispatch loop per queue claims jobs,
//! runs the queue's [`JobProcessor`] under a concurrency limit, heartbeats
//! while it runs and records the outcome. Failed attempts are retried with
//! exponential backoff until the job's retry budget is used up.
//!
//! # Architecture
//!
//! - [`JobQueueService`] - Owns the queues, starts and stops dispatching, answers queries
//! - [`JobQueue`] - Per-queue façade: [`add`](JobQueue::add) and [`process`](JobQueue::process)
//! - [`JobQueueStrategy`] - Storage engine; [`InMemoryJobQueueStrategy`] ships here,
//!   a SQLite-backed polling strategy lives in `conveyor-job-store`
//! - [`JobBuffer`] - Named buffers that hold and reduce jobs until flushed
//! - [`bridge`] - Request/response between the server and worker processes
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use conveyor_job_queue::{
//!     InMemoryJobQueueStrategy, JobContext, JobOptions, JobQueueConfig, JobQueueService,
//!     ProcessError, QueueOptions,
//! };
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = JobQueueService::new(
//!         Arc::new(InMemoryJobQueueStrategy::new()),
//!         JobQueueConfig::default(),
//!     );
//!
//!     let emails = service.register_queue("send-email", QueueOptions::default().with_retries(2))?;
//!     emails
//!         .process(|ctx: JobContext| async move {
//!             let to: String = ctx.data()?;
//!             println!("sending to {to}");
//!             Ok::<Value, ProcessError>(json!({ "sent": true }))
//!         })
//!         .await?;
//!
//!     service.start().await?;
//!     let handle = emails.add("ada@example.com", JobOptions::default()).await?;
//!     let job = handle.wait().await?;
//!     println!("job {} finished as {}", job.id, job.state);
//!
//!     service.stop().await;
//!     Ok(())
//! }
//! ```

mod backoff;
pub mod bridge;
mod buffer;
mod dispatcher;
mod error;
mod handle;
mod memory;
mod processor;
mod queue;
mod service;
mod strategy;
mod types;
mod updates;

pub use backoff::BackoffPolicy;
pub use buffer::JobBuffer;
pub use dispatcher::{
    DispatchConfig, DEFAULT_GRACEFUL_SHUTDOWN, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_POLL_INTERVAL,
    DEFAULT_STALE_TIMEOUT,
};
pub use error::{JobQueueError, ProcessError};
pub use handle::JobHandle;
pub use memory::InMemoryJobQueueStrategy;
pub use processor::{JobContext, JobProcessor, NoOpProcessor};
pub use queue::JobQueue;
pub use service::{is_valid_queue_name, JobQueueConfig, JobQueueService, MAX_QUEUE_NAME_LEN};
pub use strategy::{Heartbeat, JobQueueStrategy};
pub use types::{
    Job, JobFilter, JobId, JobList, JobOptions, JobState, ProcessRole, QueueOptions, RunOn,
};
pub use updates::JobEvent;

// Re-export async_trait for implementors of the strategy and processor traits
pub use async_trait::async_trait;
