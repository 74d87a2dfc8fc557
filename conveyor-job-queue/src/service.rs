//! Service owning the registered queues and their dispatch loops.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex as AsyncMutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::buffer::{BufferSet, JobBuffer};
use crate::dispatcher::{DispatchConfig, Dispatcher, DispatcherHandle, RunningJobs};
use crate::error::JobQueueError;
use crate::handle::JobHandle;
use crate::processor::JobProcessor;
use crate::queue::JobQueue;
use crate::strategy::JobQueueStrategy;
use crate::types::{Job, JobFilter, JobId, JobList, JobState, ProcessRole, QueueOptions};
use crate::updates::{JobEvent, JobUpdates};

/// Maximum length of a queue name.
pub const MAX_QUEUE_NAME_LEN: usize = 64;

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Settings of a [`JobQueueService`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobQueueConfig {
    pub role: ProcessRole,
    pub dispatch: DispatchConfig,
    /// Hold jobs added before [`JobQueueService::start`] and persist them on start.
    pub buffering: bool,
    /// Capacity of the local job event channel.
    pub event_capacity: usize,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            role: ProcessRole::Worker,
            dispatch: DispatchConfig::default(),
            buffering: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Returns true if `name` is a valid queue name.
pub fn is_valid_queue_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_QUEUE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

struct QueueEntry {
    options: QueueOptions,
    processor: Option<Arc<dyn JobProcessor>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Started,
    Stopped,
}

struct Lifecycle {
    phase: Phase,
    /// Jobs added before the first start while buffering is on.
    startup: Vec<Job>,
    buffers: BufferSet,
    dispatchers: Vec<DispatcherHandle>,
}

struct Inner {
    strategy: Arc<dyn JobQueueStrategy>,
    config: JobQueueConfig,
    updates: JobUpdates,
    running: RunningJobs,
    // Lock order: `lifecycle` before `queues`.
    lifecycle: AsyncMutex<Lifecycle>,
    queues: Mutex<HashMap<String, QueueEntry>>,
}

/// Entry point of the job queue: registers queues, runs their dispatchers and
/// answers queries about jobs.
#[derive(Clone)]
pub struct JobQueueService {
    inner: Arc<Inner>,
}

impl fmt::Debug for JobQueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueueService")
            .field("strategy", &self.inner.strategy.name())
            .field("role", &self.inner.config.role)
            .field("queues", &self.queue_names())
            .finish()
    }
}

impl JobQueueService {
    pub fn new(strategy: Arc<dyn JobQueueStrategy>, config: JobQueueConfig) -> Self {
        let updates = JobUpdates::new(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                strategy,
                config,
                updates,
                running: RunningJobs::default(),
                lifecycle: AsyncMutex::new(Lifecycle {
                    phase: Phase::Idle,
                    startup: Vec::new(),
                    buffers: BufferSet::default(),
                    dispatchers: Vec::new(),
                }),
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[inline]
    pub fn role(&self) -> ProcessRole {
        self.inner.config.role
    }

    #[inline]
    pub fn config(&self) -> &JobQueueConfig {
        &self.inner.config
    }

    #[inline]
    pub fn strategy(&self) -> &Arc<dyn JobQueueStrategy> {
        &self.inner.strategy
    }

    /// Register a queue, or return the existing one if it was registered with
    /// the same options.
    pub fn register_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<JobQueue, JobQueueError> {
        if !is_valid_queue_name(name) {
            return Err(JobQueueError::InvalidQueueName(name.to_owned()));
        }
        if options.concurrency == 0 || options.concurrency > Semaphore::MAX_PERMITS {
            return Err(JobQueueError::InvalidQueueOptions {
                queue: name.to_owned(),
                reason: format!("concurrency must be between 1 and {}", Semaphore::MAX_PERMITS),
            });
        }

        let mut queues = self.lock_queues();
        match queues.get(name) {
            Some(entry) if entry.options == options => {}
            Some(_) => return Err(JobQueueError::QueueConflict(name.to_owned())),
            None => {
                queues.insert(
                    name.to_owned(),
                    QueueEntry {
                        options,
                        processor: None,
                    },
                );
                debug!(queue = name, concurrency = options.concurrency, "registered job queue");
            }
        }
        Ok(JobQueue::new(name, options, self.clone()))
    }

    /// The registered queue named `name`.
    pub fn queue(&self, name: &str) -> Option<JobQueue> {
        let queues = self.lock_queues();
        queues
            .get(name)
            .map(|entry| JobQueue::new(name, entry.options, self.clone()))
    }

    /// Names of all registered queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock_queues().keys().cloned().collect();
        names.sort();
        names
    }

    /// Flush the startup buffer and start dispatching every queue that has a
    /// processor and runs in this process's role.
    pub async fn start(&self) -> Result<(), JobQueueError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.phase == Phase::Started {
            return Ok(());
        }

        let buffered = std::mem::take(&mut lifecycle.startup);
        if !buffered.is_empty() {
            let collapsed = lifecycle.buffers.collapse(buffered, &self.inner.updates);
            info!(count = collapsed.len(), "flushing jobs buffered before start");
            let mut pending = collapsed.into_iter();
            while let Some(job) = pending.next() {
                if let Err(err) = self.persist(job.clone()).await {
                    // Keep the failed job and everything after it for the next start.
                    let mut unflushed = vec![job];
                    unflushed.extend(pending);
                    warn!(
                        error = %err,
                        unflushed = unflushed.len(),
                        "failed to persist buffered jobs; service not started"
                    );
                    lifecycle.startup = unflushed;
                    return Err(err);
                }
            }
        }
        lifecycle.phase = Phase::Started;

        let runnable: Vec<(String, usize, Arc<dyn JobProcessor>)> = {
            let queues = self.lock_queues();
            queues
                .iter()
                .filter(|(_, entry)| entry.options.run_on.includes(self.inner.config.role))
                .filter_map(|(name, entry)| {
                    entry
                        .processor
                        .as_ref()
                        .map(|p| (name.clone(), entry.options.concurrency, Arc::clone(p)))
                })
                .collect()
        };
        for (name, concurrency, processor) in runnable {
            let handle = self.dispatcher(&name, concurrency, processor).spawn();
            lifecycle.dispatchers.push(handle);
        }

        info!(
            role = %self.inner.config.role,
            strategy = self.inner.strategy.name(),
            dispatchers = lifecycle.dispatchers.len(),
            "job queue service started"
        );
        Ok(())
    }

    /// Stop all dispatchers and wait for running jobs up to the graceful
    /// shutdown timeout. Jobs still running afterwards stay RUNNING and are
    /// reclaimed once their heartbeat goes stale.
    pub async fn stop(&self) {
        let dispatchers = {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            if lifecycle.phase != Phase::Started {
                return;
            }
            lifecycle.phase = Phase::Stopped;
            std::mem::take(&mut lifecycle.dispatchers)
        };

        for dispatcher in &dispatchers {
            dispatcher.signal();
        }

        let deadline = Instant::now() + self.inner.config.dispatch.graceful_shutdown_timeout;
        let mut unfinished = Vec::new();
        for dispatcher in dispatchers {
            let queue = dispatcher.queue().to_owned();
            if !dispatcher.drain(deadline).await {
                unfinished.push(queue);
            }
        }

        if unfinished.is_empty() {
            info!("job queue service stopped");
        } else {
            warn!(
                queues = ?unfinished,
                "job queue service stopped with jobs still running; they will be reclaimed when stale"
            );
        }
    }

    /// Whether the service is dispatching.
    pub async fn is_started(&self) -> bool {
        self.inner.lifecycle.lock().await.phase == Phase::Started
    }

    pub async fn query(&self, filter: &JobFilter) -> Result<JobList, JobQueueError> {
        self.inner.strategy.find_many(filter).await
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>, JobQueueError> {
        self.inner.strategy.find_one(id).await
    }

    /// Cancel a job.
    ///
    /// Pending and retrying jobs (including ones still held in a buffer)
    /// become CANCELLED. A running job is asked to stop and keeps its state
    /// until its processor returns. Settled jobs are returned unchanged.
    pub async fn cancel(&self, id: JobId) -> Result<Option<Job>, JobQueueError> {
        let held = {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            match lifecycle.startup.iter().position(|job| job.id == id) {
                Some(position) => Some(lifecycle.startup.remove(position)),
                None => lifecycle.buffers.extract(id),
            }
        };
        if let Some(mut job) = held {
            job.cancel(Utc::now());
            let job = self.persist(job).await.inspect_err(|_| {
                self.inner.updates.release(id);
            })?;
            info!(queue = %job.queue_name, job_id = %id, "cancelled buffered job");
            self.inner.updates.publish_changed(&job);
            return Ok(Some(job));
        }

        let Some(job) = self.inner.strategy.cancel(id).await? else {
            return Ok(None);
        };
        match job.state {
            JobState::Cancelled if job.is_settled => {
                info!(queue = %job.queue_name, job_id = %id, "job cancelled");
                self.inner.updates.publish_changed(&job);
            }
            JobState::Running if job.cancel_requested => {
                let local = self.inner.running.signal(id);
                info!(queue = %job.queue_name, job_id = %id, local, "cancel requested for running job");
            }
            _ => {}
        }
        Ok(Some(job))
    }

    /// Delete settled jobs settled before `older_than`. An empty `queue_names`
    /// means every queue.
    pub async fn remove_settled_jobs(
        &self,
        queue_names: &[String],
        older_than: DateTime<Utc>,
    ) -> Result<u64, JobQueueError> {
        let removed = self
            .inner
            .strategy
            .remove_settled(queue_names, older_than)
            .await?;
        info!(removed, "removed settled jobs");
        Ok(removed)
    }

    pub async fn add_buffer(&self, buffer: Arc<dyn JobBuffer>) -> Result<(), JobQueueError> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        lifecycle.buffers.add(buffer)
    }

    /// Unregister a buffer. Jobs it held are not persisted and are returned.
    pub async fn remove_buffer(&self, id: &str) -> Option<Vec<Job>> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let dropped = lifecycle.buffers.remove(id)?;
        for job in &dropped {
            self.inner.updates.release(job.id);
        }
        Some(dropped)
    }

    /// Number of jobs held by the given buffers (all buffers if empty).
    pub async fn buffer_size(&self, buffer_ids: &[String]) -> usize {
        let lifecycle = self.inner.lifecycle.lock().await;
        lifecycle.buffers.size(buffer_ids)
    }

    /// Persist the jobs held by the given buffers (all buffers if empty).
    /// Returns the number of jobs persisted after reduction.
    pub async fn flush(&self, buffer_ids: &[String]) -> Result<usize, JobQueueError> {
        let jobs = {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            lifecycle.buffers.take(buffer_ids, &self.inner.updates)
        };
        let count = jobs.len();
        let mut pending = jobs.into_iter();
        while let Some(job) = pending.next() {
            if let Err(err) = self.persist(job.clone()).await {
                // Taken jobs are not put back; their handles stop waiting.
                let lost: Vec<Job> = std::iter::once(job).chain(pending).collect();
                warn!(error = %err, lost = lost.len(), "failed to persist flushed jobs");
                for job in &lost {
                    self.inner.updates.release(job.id);
                }
                return Err(err);
            }
        }
        Ok(count)
    }

    /// Local job events. Only jobs executed by this process are reported.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.updates.subscribe()
    }

    pub(crate) fn handle(&self, job: Job) -> JobHandle {
        JobHandle::new(
            job,
            Arc::clone(&self.inner.strategy),
            self.inner.updates.clone(),
            self.inner.config.dispatch.poll_interval,
        )
    }

    /// Route a new job through the startup buffer, a named buffer or the strategy.
    pub(crate) async fn enqueue(&self, job: Job) -> Result<Job, JobQueueError> {
        let job = {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            if lifecycle.phase == Phase::Idle && self.inner.config.buffering {
                debug!(queue = %job.queue_name, job_id = %job.id, "buffering job until start");
                self.inner.updates.hold(job.id);
                lifecycle.startup.push(job.clone());
                return Ok(job);
            }
            match lifecycle.buffers.collect(job.clone()) {
                Some(job) => job,
                None => {
                    debug!(queue = %job.queue_name, job_id = %job.id, "job held by buffer");
                    self.inner.updates.hold(job.id);
                    return Ok(job);
                }
            }
        };
        self.persist(job).await
    }

    pub(crate) async fn set_processor(
        &self,
        queue: &str,
        processor: Arc<dyn JobProcessor>,
    ) -> Result<(), JobQueueError> {
        let options = {
            let mut queues = self.lock_queues();
            let entry = queues
                .get_mut(queue)
                .ok_or_else(|| JobQueueError::UnknownQueue(queue.to_owned()))?;
            if entry.processor.is_some() {
                return Err(JobQueueError::DuplicateProcessor(queue.to_owned()));
            }
            entry.processor = Some(Arc::clone(&processor));
            entry.options
        };

        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.phase == Phase::Started && options.run_on.includes(self.inner.config.role) {
            let handle = self.dispatcher(queue, options.concurrency, processor).spawn();
            lifecycle.dispatchers.push(handle);
        }
        Ok(())
    }

    /// Store a job. A buffered job stops counting as held once it is stored.
    async fn persist(&self, job: Job) -> Result<Job, JobQueueError> {
        let queue = job.queue_name.clone();
        let stored = self
            .inner
            .strategy
            .add(job)
            .await
            .map_err(|err| JobQueueError::Enqueue {
                queue,
                message: err.to_string(),
            })?;
        self.inner.updates.release(stored.id);
        Ok(stored)
    }

    fn dispatcher(
        &self,
        queue: &str,
        concurrency: usize,
        processor: Arc<dyn JobProcessor>,
    ) -> Dispatcher {
        Dispatcher::new(
            queue,
            concurrency,
            processor,
            Arc::clone(&self.inner.strategy),
            self.inner.updates.clone(),
            self.inner.running.clone(),
            self.inner.config.dispatch.clone(),
        )
    }

    fn lock_queues(&self) -> std::sync::MutexGuard<'_, HashMap<String, QueueEntry>> {
        self.inner
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryJobQueueStrategy;
    use crate::processor::NoOpProcessor;
    use crate::types::RunOn;

    fn service() -> JobQueueService {
        JobQueueService::new(
            Arc::new(InMemoryJobQueueStrategy::new()),
            JobQueueConfig::default(),
        )
    }

    #[test]
    fn queue_names_are_validated() {
        assert!(is_valid_queue_name("send-email"));
        assert!(is_valid_queue_name("search.index_v2"));
        assert!(!is_valid_queue_name(""));
        assert!(!is_valid_queue_name("has space"));
        assert!(!is_valid_queue_name(&"x".repeat(MAX_QUEUE_NAME_LEN + 1)));

        let service = service();
        assert!(matches!(
            service.register_queue("bad/name", QueueOptions::default()),
            Err(JobQueueError::InvalidQueueName(_))
        ));
        assert!(matches!(
            service.register_queue("zero", QueueOptions::default().with_concurrency(0)),
            Err(JobQueueError::InvalidQueueOptions { .. })
        ));
    }

    #[test]
    fn re_registering_requires_identical_options() {
        let service = service();
        service
            .register_queue("emails", QueueOptions::default())
            .unwrap();
        assert!(service
            .register_queue("emails", QueueOptions::default())
            .is_ok());
        assert!(matches!(
            service.register_queue("emails", QueueOptions::default().with_retries(3)),
            Err(JobQueueError::QueueConflict(_))
        ));
        assert_eq!(service.queue_names(), vec!["emails".to_owned()]);
    }

    #[tokio::test]
    async fn second_processor_is_rejected() {
        let service = service();
        let queue = service
            .register_queue("emails", QueueOptions::default())
            .unwrap();
        queue.process(NoOpProcessor).await.unwrap();
        let err = queue.process(NoOpProcessor).await.unwrap_err();
        assert!(matches!(err, JobQueueError::DuplicateProcessor(ref q) if q == "emails"));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn queues_for_other_roles_are_not_dispatched() {
        let service = JobQueueService::new(
            Arc::new(InMemoryJobQueueStrategy::new()),
            JobQueueConfig {
                role: ProcessRole::Server,
                buffering: false,
                ..JobQueueConfig::default()
            },
        );
        let queue = service
            .register_queue("emails", QueueOptions::default().with_run_on(RunOn::Worker))
            .unwrap();
        queue.process(NoOpProcessor).await.unwrap();
        service.start().await.unwrap();

        let handle = queue
            .add(&serde_json::json!({}), Default::default())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(handle.refresh().await.unwrap().state, JobState::Pending);
        service.stop().await;
    }
}
