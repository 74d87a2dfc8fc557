//! Concrete job processors for conveyor.
//!
//! # Queues
//!
//! - `update-search-index` - re-index documents; merged by [`SearchIndexBuffer`]
//! - `send-email` - render and deliver an email
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use conveyor_job_queue::{InMemoryJobQueueStrategy, JobQueueConfig, JobQueueService, QueueOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = JobQueueService::new(
//!         Arc::new(InMemoryJobQueueStrategy::new()),
//!         JobQueueConfig::default(),
//!     );
//!     conveyor_jobs::register_all(&service, |_| QueueOptions::default()).await.unwrap();
//!     service.start().await.unwrap();
//! }
//! ```

mod email;
mod error;
mod messages;
mod search_index;

use std::sync::Arc;

use conveyor_job_queue::{JobQueueError, JobQueueService, QueueOptions};
use tracing::info;

pub use email::{render_template, EmailPayload, EmailProcessor, RenderedEmail};
pub use error::JobError;
pub use messages::{bridge_router, RenderEmailPreview, WorkerPing, WorkerPong};
pub use search_index::{DocumentRef, SearchIndexBuffer, SearchIndexPayload, SearchIndexProcessor};

/// Queue name constants.
pub mod job_types {
    pub const UPDATE_SEARCH_INDEX: &str = "update-search-index";
    pub const SEND_EMAIL: &str = "send-email";

    pub const ALL: &[&str] = &[UPDATE_SEARCH_INDEX, SEND_EMAIL];
}

/// Register every queue, its processor and the search index buffer.
///
/// `options` returns the registration options of each queue.
pub async fn register_all<F>(service: &JobQueueService, mut options: F) -> Result<(), JobQueueError>
where
    F: FnMut(&str) -> QueueOptions,
{
    service
        .register_queue(
            job_types::UPDATE_SEARCH_INDEX,
            options(job_types::UPDATE_SEARCH_INDEX),
        )?
        .process(SearchIndexProcessor::new())
        .await?;

    service
        .register_queue(job_types::SEND_EMAIL, options(job_types::SEND_EMAIL))?
        .process(EmailProcessor::default())
        .await?;

    service.add_buffer(Arc::new(SearchIndexBuffer::new())).await?;

    info!(queues = ?job_types::ALL, "registered job processors");
    Ok(())
}
