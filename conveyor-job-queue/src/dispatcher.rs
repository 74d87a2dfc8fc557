//! Per-queue dispatch loop shared by every strategy.

use std::collections::HashMap;
use std::future::pending;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::{JobQueueError, ProcessError};
use crate::processor::{JobContext, JobProcessor};
use crate::strategy::{Heartbeat, JobQueueStrategy};
use crate::types::{Job, JobId, JobState};
use crate::updates::JobUpdates;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(20);
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Timing knobs for dispatch loops.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Sleep between polls when a queue has no claimable work.
    pub poll_interval: Duration,
    /// How often a running job refreshes its record.
    pub heartbeat_interval: Duration,
    /// RUNNING records without a heartbeat for this long are reclaimed.
    pub stale_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// How long `stop` waits for running jobs.
    pub graceful_shutdown_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stale_timeout: DEFAULT_STALE_TIMEOUT,
            backoff: BackoffPolicy::default(),
            graceful_shutdown_timeout: DEFAULT_GRACEFUL_SHUTDOWN,
        }
    }
}

/// Cancel signals of the jobs executing in this process.
#[derive(Debug, Clone, Default)]
pub(crate) struct RunningJobs(Arc<Mutex<HashMap<JobId, watch::Sender<bool>>>>);

impl RunningJobs {
    fn insert(&self, id: JobId, tx: watch::Sender<bool>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
    }

    fn remove(&self, id: JobId) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Signal a locally running job. Returns false if it is not running here.
    pub(crate) fn signal(&self, id: JobId) -> bool {
        let running = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match running.get(&id) {
            Some(tx) => {
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }
}

pub(crate) struct Dispatcher {
    queue: String,
    concurrency: usize,
    processor: Arc<dyn JobProcessor>,
    strategy: Arc<dyn JobQueueStrategy>,
    updates: JobUpdates,
    running: RunningJobs,
    config: DispatchConfig,
}

impl Dispatcher {
    pub(crate) fn new(
        queue: impl Into<String>,
        concurrency: usize,
        processor: Arc<dyn JobProcessor>,
        strategy: Arc<dyn JobQueueStrategy>,
        updates: JobUpdates,
        running: RunningJobs,
        config: DispatchConfig,
    ) -> Self {
        Self {
            queue: queue.into(),
            concurrency,
            processor,
            strategy,
            updates,
            running,
            config,
        }
    }

    pub(crate) fn spawn(self) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let queue = self.queue.clone();
        let concurrency = self.concurrency;
        let task = tokio::spawn(Arc::new(self).run(Arc::clone(&semaphore), shutdown_rx));

        DispatcherHandle {
            queue,
            concurrency,
            semaphore,
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self: Arc<Self>, semaphore: Arc<Semaphore>, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue = %self.queue,
            concurrency = self.concurrency,
            strategy = self.strategy.name(),
            "dispatcher started"
        );
        let wake = self.strategy.wake_signal(&self.queue);
        let mut next_sweep = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if Instant::now() >= next_sweep {
                self.sweep_stale().await;
                next_sweep = Instant::now() + self.config.poll_interval;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            match self.strategy.claim_next(&self.queue).await {
                Ok(Some(job)) => {
                    self.spawn_execution(job, permit);
                    continue;
                }
                Ok(None) => drop(permit),
                Err(err) => {
                    drop(permit);
                    warn!(queue = %self.queue, error = %err, "failed to poll for jobs");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = notified(wake.as_deref()) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!(queue = %self.queue, "dispatcher stopped");
    }

    async fn sweep_stale(&self) {
        let Ok(stale_timeout) = chrono::Duration::from_std(self.config.stale_timeout) else {
            return;
        };
        let stale_before = Utc::now() - stale_timeout;

        match self.strategy.reclaim_stale(&self.queue, stale_before).await {
            Ok(reclaimed) => {
                for job in reclaimed {
                    let event = JobQueueError::StaleJobReclaimed {
                        job_id: job.id,
                        queue: job.queue_name.clone(),
                    };
                    warn!(
                        queue = %self.queue,
                        job_id = %job.id,
                        attempts = job.attempts,
                        state = %job.state,
                        "{event}"
                    );
                    self.updates.publish_changed(&job);
                }
            }
            Err(err) => {
                warn!(queue = %self.queue, error = %err, "failed to reclaim stale jobs");
            }
        }
    }

    fn spawn_execution(self: &Arc<Self>, job: Job, permit: OwnedSemaphorePermit) {
        let (cancel_tx, cancel_rx) = watch::channel(job.cancel_requested);
        self.running.insert(job.id, cancel_tx.clone());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            let id = job.id;
            this.execute(job, cancel_tx, cancel_rx).await;
            this.running.remove(id);
        });
    }

    async fn execute(&self, job: Job, cancel_tx: watch::Sender<bool>, cancel_rx: watch::Receiver<bool>) {
        let id = job.id;
        let attempts = job.attempts;
        info!(queue = %self.queue, job_id = %id, attempt = attempts, "job started");
        self.updates.publish_changed(&job);

        let progress = Arc::new(AtomicU8::new(job.progress));
        let ctx = JobContext::new(
            job.clone(),
            Arc::clone(&progress),
            cancel_rx,
            self.updates.clone(),
        );
        let processor = Arc::clone(&self.processor);
        // Own task so a panicking processor becomes a failed attempt.
        let mut work = tokio::spawn(async move { processor.process(ctx).await });

        let mut heartbeat =
            tokio::time::interval(self.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL));
        heartbeat.tick().await;
        let mut lost = false;

        let outcome = loop {
            tokio::select! {
                outcome = &mut work => break outcome,
                _ = heartbeat.tick() => {
                    let current = progress.load(Ordering::Relaxed);
                    match self.strategy.heartbeat(id, attempts, current).await {
                        Ok(Heartbeat::Owned { cancel_requested: true }) => {
                            if !*cancel_tx.borrow() {
                                info!(queue = %self.queue, job_id = %id, "cancel requested for running job");
                                cancel_tx.send_replace(true);
                            }
                        }
                        Ok(Heartbeat::Owned { .. }) => {}
                        Ok(Heartbeat::Lost) if !lost => {
                            lost = true;
                            warn!(
                                queue = %self.queue,
                                job_id = %id,
                                "job no longer owned by this process; signalling processor to stop"
                            );
                            cancel_tx.send_replace(true);
                        }
                        Ok(Heartbeat::Lost) => {}
                        Err(err) => {
                            warn!(queue = %self.queue, job_id = %id, error = %err, "failed to record heartbeat");
                        }
                    }
                }
            }
        };

        let mut job = job;
        job.set_progress(progress.load(Ordering::Relaxed));
        let now = Utc::now();
        match outcome {
            Ok(Ok(result)) => job.complete(result, now),
            Ok(Err(ProcessError::Cancelled)) => job.cancel(now),
            Ok(Err(ProcessError::Failed(message))) => {
                warn!(queue = %self.queue, job_id = %id, attempt = attempts, error = %message, "job attempt failed");
                job.fail(message, &self.config.backoff, now);
            }
            Err(err) => {
                let message = panic_message(err);
                error!(queue = %self.queue, job_id = %id, attempt = attempts, error = %message, "job processor aborted");
                job.fail(message, &self.config.backoff, now);
            }
        }

        match self.strategy.settle(&job).await {
            Ok(true) => {
                match job.state {
                    JobState::Completed => info!(queue = %self.queue, job_id = %id, "job completed"),
                    JobState::Retrying => info!(
                        queue = %self.queue,
                        job_id = %id,
                        retry_at = ?job.retry_at,
                        "job scheduled for retry"
                    ),
                    JobState::Failed => warn!(
                        queue = %self.queue,
                        job_id = %id,
                        attempts = job.attempts,
                        "job failed permanently"
                    ),
                    JobState::Cancelled => info!(queue = %self.queue, job_id = %id, "job cancelled"),
                    JobState::Pending | JobState::Running => {}
                }
                self.updates.publish_changed(&job);
            }
            Ok(false) => {
                debug!(
                    queue = %self.queue,
                    job_id = %id,
                    attempt = attempts,
                    "discarding outcome of job that is no longer owned"
                );
            }
            Err(err) => {
                error!(queue = %self.queue, job_id = %id, error = %err, "failed to persist job outcome");
            }
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "job processor was aborted".to_owned();
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());
    format!("job processor panicked: {detail}")
}

async fn notified(signal: Option<&Notify>) {
    match signal {
        Some(signal) => signal.notified().await,
        None => pending::<()>().await,
    }
}

/// Control handle of a spawned dispatch loop.
#[derive(Debug)]
pub(crate) struct DispatcherHandle {
    queue: String,
    concurrency: usize,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    pub(crate) fn queue(&self) -> &str {
        &self.queue
    }

    /// Ask the loop to stop claiming work.
    pub(crate) fn signal(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait for the loop and its running jobs until `deadline`. Returns false
    /// if jobs were still running when the deadline passed.
    pub(crate) async fn drain(self, deadline: Instant) -> bool {
        self.signal();
        if tokio::time::timeout_at(deadline, self.task).await.is_err() {
            return false;
        }
        let permits = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        matches!(
            tokio::time::timeout_at(deadline, self.semaphore.acquire_many(permits)).await,
            Ok(Ok(_))
        )
    }
}
