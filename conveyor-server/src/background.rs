use std::time::Duration;

use conveyor_job_queue::JobQueueService;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Flush every named buffer each `interval` until `shutdown` turns true.
///
/// Named buffers keep collecting after the service starts, so without this
/// loop their jobs would only run on an explicit `/api/buffers/flush`.
pub fn spawn_buffer_flusher(
    service: JobQueueService,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if service.buffer_size(&[]).await == 0 {
                continue;
            }
            match service.flush(&[]).await {
                Ok(flushed) => debug!(flushed, "flushed job buffers"),
                Err(error) => warn!(%error, "buffer flush failed"),
            }
        }
        debug!("buffer flusher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use conveyor_job_queue::{
        InMemoryJobQueueStrategy, JobOptions, JobQueueConfig, JobState, QueueOptions,
    };
    use conveyor_jobs::{job_types, DocumentRef, SearchIndexPayload};

    #[tokio::test]
    async fn held_jobs_run_without_a_manual_flush() {
        let service = JobQueueService::new(
            Arc::new(InMemoryJobQueueStrategy::new()),
            JobQueueConfig::default(),
        );
        conveyor_jobs::register_all(&service, |_| QueueOptions::default())
            .await
            .unwrap();
        service.start().await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flusher =
            spawn_buffer_flusher(service.clone(), Duration::from_millis(50), shutdown_rx);

        let handle = service
            .queue(job_types::UPDATE_SEARCH_INDEX)
            .unwrap()
            .add(
                &SearchIndexPayload {
                    documents: vec![DocumentRef::new("product", "1")],
                },
                JobOptions::default(),
            )
            .await
            .unwrap();

        let job = handle.wait_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(job.state, JobState::Completed);

        shutdown_tx.send(true).unwrap();
        flusher.await.unwrap();
        service.stop().await;
    }
}
