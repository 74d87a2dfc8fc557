use conveyor_job_queue::bridge::ProcessBridge;
use conveyor_job_queue::JobQueueService;

/// Shared application state passed to every route handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub jobs: JobQueueService,
    /// Sends requests to the worker role.
    pub bridge: ProcessBridge,
}

impl AppState {
    pub fn new(jobs: JobQueueService, bridge: ProcessBridge) -> Self {
        Self { jobs, bridge }
    }
}
