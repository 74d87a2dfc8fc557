use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conveyor_job_queue::{
    async_trait, BackoffPolicy, DispatchConfig, Heartbeat, InMemoryJobQueueStrategy, Job,
    JobBuffer, JobContext, JobFilter, JobId, JobList, JobOptions, JobQueueConfig,
    JobQueueError, JobQueueService, JobQueueStrategy, JobState, ProcessError, QueueOptions,
};
use serde_json::{json, Value};
use tokio::sync::Notify;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn service(buffering: bool) -> JobQueueService {
    JobQueueService::new(
        Arc::new(InMemoryJobQueueStrategy::new()),
        JobQueueConfig {
            dispatch: DispatchConfig {
                poll_interval: Duration::from_millis(10),
                heartbeat_interval: Duration::from_millis(20),
                backoff: BackoffPolicy::fixed(Duration::ZERO),
                ..DispatchConfig::default()
            },
            buffering,
            ..JobQueueConfig::default()
        },
    )
}

/// Collapses all jobs of one queue into the most recent one.
struct LatestOnly {
    queue: &'static str,
}

impl JobBuffer for LatestOnly {
    fn id(&self) -> &str {
        self.queue
    }

    fn collect(&self, job: &Job) -> bool {
        job.queue_name == self.queue
    }

    fn reduce(&self, mut jobs: Vec<Job>) -> Vec<Job> {
        jobs.pop().into_iter().collect()
    }
}

#[tokio::test]
async fn jobs_added_before_start_are_persisted_once_in_order() {
    let service = service(true);
    let queue = service.register_queue("emails", QueueOptions::default()).unwrap();

    let fixed = Uuid::new_v4();
    let first = queue.add(&json!(1), JobOptions::default()).await.unwrap();
    let dup_a = queue
        .add(&json!(2), JobOptions::default().job_id(fixed))
        .await
        .unwrap();
    let dup_b = queue
        .add(&json!("ignored"), JobOptions::default().job_id(fixed))
        .await
        .unwrap();
    let last = queue.add(&json!(3), JobOptions::default()).await.unwrap();
    assert_eq!(dup_a.id(), dup_b.id());

    assert_eq!(service.query(&JobFilter::default()).await.unwrap().total, 0);

    // No processor, so nothing leaves PENDING.
    service.start().await.unwrap();

    let list = service.query(&JobFilter::default()).await.unwrap();
    assert_eq!(list.total, 3);
    let newest_first: Vec<Uuid> = list.items.iter().map(|job| job.id).collect();
    assert_eq!(newest_first, vec![last.id(), fixed, first.id()]);
    assert!(list.items.iter().all(|job| job.state == JobState::Pending));

    let kept = service.get(fixed).await.unwrap().unwrap();
    assert_eq!(kept.data, json!(2));

    // Starting again must not flush anything twice.
    service.start().await.unwrap();
    assert_eq!(service.query(&JobFilter::default()).await.unwrap().total, 3);
    service.stop().await;
}

#[tokio::test]
async fn buffered_jobs_run_after_start() {
    let service = service(true);
    let queue = service.register_queue("emails", QueueOptions::default()).unwrap();
    queue
        .process(|ctx: JobContext| async move { Ok::<_, ProcessError>(ctx.raw_data().clone()) })
        .await
        .unwrap();

    let handle = queue.add(&json!("hi"), JobOptions::default()).await.unwrap();
    assert!(handle.refresh().await.is_err());

    service.start().await.unwrap();
    let job = handle.wait_timeout(WAIT).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.result, Some(json!("hi")));
    service.stop().await;
}

#[tokio::test]
async fn cancelling_a_buffered_job_persists_it_cancelled() {
    let service = service(true);
    let queue = service.register_queue("emails", QueueOptions::default()).unwrap();
    queue
        .process(|_ctx: JobContext| async move {
            Err::<Value, _>(ProcessError::failed("must not run"))
        })
        .await
        .unwrap();

    let handle = queue.add(&json!({}), JobOptions::default()).await.unwrap();
    let cancelled = service.cancel(handle.id()).await.unwrap().unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);

    service.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let job = handle.refresh().await.unwrap();
    assert_eq!(job.state, JobState::Cancelled);
    assert_eq!(job.attempts, 0);
    assert_eq!(service.query(&JobFilter::default()).await.unwrap().total, 1);
    service.stop().await;
}

#[tokio::test]
async fn startup_collapse_applies_named_buffers() {
    let service = service(true);
    service
        .add_buffer(Arc::new(LatestOnly { queue: "indexing" }))
        .await
        .unwrap();
    let indexing = service.register_queue("indexing", QueueOptions::default()).unwrap();

    let stale = indexing.add(&json!("v1"), JobOptions::default()).await.unwrap();
    let fresh = indexing.add(&json!("v2"), JobOptions::default()).await.unwrap();
    indexing
        .process(|ctx: JobContext| async move { Ok::<_, ProcessError>(ctx.raw_data().clone()) })
        .await
        .unwrap();
    service.start().await.unwrap();

    // The collapsed job resolves with the survivor's outcome.
    let job = stale.wait_timeout(WAIT).await.unwrap();
    assert_eq!(job.id, fresh.id());
    assert_eq!(job.result, Some(json!("v2")));
    assert_eq!(stale.effective_id(), fresh.id());
    assert_eq!(service.query(&JobFilter::default()).await.unwrap().total, 1);
    service.stop().await;
}

#[tokio::test]
async fn named_buffers_hold_jobs_until_flushed() {
    let service = service(false);
    service.start().await.unwrap();
    service
        .add_buffer(Arc::new(LatestOnly { queue: "indexing" }))
        .await
        .unwrap();
    assert!(service
        .add_buffer(Arc::new(LatestOnly { queue: "indexing" }))
        .await
        .is_err());

    let indexing = service.register_queue("indexing", QueueOptions::default()).unwrap();
    let emails = service.register_queue("emails", QueueOptions::default()).unwrap();
    for i in 0..3 {
        indexing.add(&json!(i), JobOptions::default()).await.unwrap();
    }
    emails.add(&json!("direct"), JobOptions::default()).await.unwrap();

    let ids = vec!["indexing".to_owned()];
    assert_eq!(service.buffer_size(&ids).await, 3);
    assert_eq!(service.query(&JobFilter::default()).await.unwrap().total, 1);

    assert_eq!(service.flush(&ids).await.unwrap(), 1);
    assert_eq!(service.buffer_size(&[]).await, 0);

    let indexed = service
        .query(&JobFilter::default().queue("indexing"))
        .await
        .unwrap();
    assert_eq!(indexed.total, 1);
    assert_eq!(indexed.items[0].data, json!(2));

    indexing.add(&json!("held"), JobOptions::default()).await.unwrap();
    let returned = service.remove_buffer("indexing").await.unwrap();
    assert_eq!(returned.len(), 1);
    assert_eq!(returned[0].data, json!("held"));
    service.stop().await;
}

#[tokio::test]
async fn waiting_on_a_held_job_follows_its_buffer() {
    let service = service(false);
    service.start().await.unwrap();
    service
        .add_buffer(Arc::new(LatestOnly { queue: "indexing" }))
        .await
        .unwrap();
    let indexing = service.register_queue("indexing", QueueOptions::default()).unwrap();
    indexing
        .process(|ctx: JobContext| async move { Ok::<_, ProcessError>(ctx.raw_data().clone()) })
        .await
        .unwrap();

    // Held jobs are waited for until the flush stores them.
    let held = indexing.add(&json!("v1"), JobOptions::default()).await.unwrap();
    let waiter = tokio::spawn({
        let held = held.clone();
        async move { held.wait_timeout(WAIT).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    assert_eq!(service.flush(&[]).await.unwrap(), 1);
    let job = waiter.await.unwrap().unwrap();
    assert_eq!(job.result, Some(json!("v1")));

    // Jobs handed back by a removed buffer are never stored.
    let dropped = indexing.add(&json!("v2"), JobOptions::default()).await.unwrap();
    assert_eq!(service.remove_buffer("indexing").await.unwrap().len(), 1);
    let err = dropped.wait_timeout(WAIT).await.unwrap_err();
    assert!(matches!(err, JobQueueError::NotFound(id) if id == dropped.id()));
    service.stop().await;
}

/// In-memory store whose next `add` fails once when armed.
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryJobQueueStrategy,
    fail_next_add: AtomicBool,
}

#[async_trait]
impl JobQueueStrategy for FlakyStore {
    async fn add(&self, job: Job) -> Result<Job, JobQueueError> {
        if self.fail_next_add.swap(false, Ordering::SeqCst) {
            return Err(JobQueueError::TransientStore("disk hiccup".into()));
        }
        self.inner.add(job).await
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, JobQueueError> {
        self.inner.claim_next(queue).await
    }

    async fn heartbeat(
        &self,
        id: JobId,
        attempts: u32,
        progress: u8,
    ) -> Result<Heartbeat, JobQueueError> {
        self.inner.heartbeat(id, attempts, progress).await
    }

    async fn settle(&self, job: &Job) -> Result<bool, JobQueueError> {
        self.inner.settle(job).await
    }

    async fn reclaim_stale(
        &self,
        queue: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobQueueError> {
        self.inner.reclaim_stale(queue, stale_before).await
    }

    async fn find_one(&self, id: JobId) -> Result<Option<Job>, JobQueueError> {
        self.inner.find_one(id).await
    }

    async fn find_many(&self, filter: &JobFilter) -> Result<JobList, JobQueueError> {
        self.inner.find_many(filter).await
    }

    async fn cancel(&self, id: JobId) -> Result<Option<Job>, JobQueueError> {
        self.inner.cancel(id).await
    }

    async fn remove_settled(
        &self,
        queue_names: &[String],
        older_than: DateTime<Utc>,
    ) -> Result<u64, JobQueueError> {
        self.inner.remove_settled(queue_names, older_than).await
    }

    fn wake_signal(&self, queue: &str) -> Option<Arc<Notify>> {
        self.inner.wake_signal(queue)
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

#[tokio::test]
async fn failed_startup_flush_keeps_jobs_and_can_be_retried() {
    let store = Arc::new(FlakyStore::default());
    let service = JobQueueService::new(
        store.clone(),
        JobQueueConfig {
            dispatch: DispatchConfig {
                poll_interval: Duration::from_millis(10),
                heartbeat_interval: Duration::from_millis(20),
                ..DispatchConfig::default()
            },
            buffering: true,
            ..JobQueueConfig::default()
        },
    );
    let emails = service.register_queue("emails", QueueOptions::default()).unwrap();
    emails
        .process(|ctx: JobContext| async move { Ok::<_, ProcessError>(ctx.raw_data().clone()) })
        .await
        .unwrap();

    let first = emails.add(&json!(1), JobOptions::default()).await.unwrap();
    let second = emails.add(&json!(2), JobOptions::default()).await.unwrap();

    store.fail_next_add.store(true, Ordering::SeqCst);
    let err = service.start().await.unwrap_err();
    assert!(matches!(err, JobQueueError::Enqueue { .. }));
    assert!(!service.is_started().await);
    assert!(service.get(first.id()).await.unwrap().is_none());

    service.start().await.unwrap();
    assert!(service.is_started().await);
    for (handle, data) in [(&first, json!(1)), (&second, json!(2))] {
        let job = handle.wait_timeout(WAIT).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.result, Some(data));
    }

    // Dispatchers are running for jobs added after the retried start.
    let late = emails.add(&json!(3), JobOptions::default()).await.unwrap();
    assert_eq!(late.wait_timeout(WAIT).await.unwrap().state, JobState::Completed);
    service.stop().await;
}
