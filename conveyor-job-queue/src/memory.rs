//! Process-local job strategy.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::error::JobQueueError;
use crate::strategy::{Heartbeat, JobQueueStrategy};
use crate::types::{Job, JobFilter, JobId, JobList, JobState};

/// Maximum number of settled jobs kept in memory.
const MAX_SETTLED_JOBS: usize = 10_000;

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    /// Every job id, oldest first.
    order: VecDeque<JobId>,
    /// Per queue, ids that may become claimable, oldest first.
    pending: HashMap<String, VecDeque<JobId>>,
    /// Settled ids in settlement order, used to bound memory.
    settled: VecDeque<JobId>,
}

impl MemoryState {
    fn insert(&mut self, job: Job) {
        let id = job.id;
        self.pending
            .entry(job.queue_name.clone())
            .or_default()
            .push_back(id);
        self.order.push_back(id);
        self.jobs.insert(id, job);
    }

    fn mark_settled(&mut self, id: JobId) {
        self.settled.push_back(id);

        if self.settled.len() > MAX_SETTLED_JOBS {
            let mut evicted = 0;
            while self.settled.len() > MAX_SETTLED_JOBS {
                if let Some(old) = self.settled.pop_front() {
                    self.jobs.remove(&old);
                    evicted += 1;
                }
            }
            if evicted > 0 {
                let jobs = &self.jobs;
                self.order.retain(|id| jobs.contains_key(id));
            }
        }
    }

    fn requeue(&mut self, job: &Job) {
        self.pending
            .entry(job.queue_name.clone())
            .or_default()
            .push_back(job.id);
    }

    fn iter_recent(&self) -> impl Iterator<Item = &Job> {
        self.order.iter().rev().filter_map(|id| self.jobs.get(id))
    }
}

/// Strategy that keeps every job in process memory.
///
/// Jobs do not survive a restart and are invisible to other processes. Claims
/// are a mutex-protected pop, and `add` wakes the queue's dispatcher at once.
pub struct InMemoryJobQueueStrategy {
    state: Mutex<MemoryState>,
    wakers: StdMutex<HashMap<String, Arc<Notify>>>,
}

impl fmt::Debug for InMemoryJobQueueStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryJobQueueStrategy")
            .field("state", &"<Mutex<MemoryState>>")
            .finish()
    }
}

impl Default for InMemoryJobQueueStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobQueueStrategy {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            wakers: StdMutex::new(HashMap::new()),
        }
    }

    fn waker(&self, queue: &str) -> Arc<Notify> {
        let mut wakers = self.wakers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(wakers.entry(queue.to_owned()).or_default())
    }

    fn wake(&self, queue: &str) {
        self.waker(queue).notify_one();
    }
}

#[async_trait]
impl JobQueueStrategy for InMemoryJobQueueStrategy {
    async fn add(&self, job: Job) -> Result<Job, JobQueueError> {
        let queue = job.queue_name.clone();
        {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.jobs.get(&job.id) {
                return Ok(existing.clone());
            }
            state.insert(job.clone());
        }
        self.wake(&queue);
        Ok(job)
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, JobQueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let MemoryState { jobs, pending, .. } = &mut *state;

        let Some(ids) = pending.get_mut(queue) else {
            return Ok(None);
        };
        ids.retain(|id| {
            jobs.get(id)
                .is_some_and(|job| matches!(job.state, JobState::Pending | JobState::Retrying))
        });

        let position = ids
            .iter()
            .position(|id| jobs.get(id).is_some_and(|job| job.is_claimable_at(now)));
        let Some(id) = position.and_then(|pos| ids.remove(pos)) else {
            return Ok(None);
        };

        Ok(jobs.get_mut(&id).map(|job| {
            job.start(now);
            job.clone()
        }))
    }

    async fn heartbeat(
        &self,
        id: JobId,
        attempts: u32,
        progress: u8,
    ) -> Result<Heartbeat, JobQueueError> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Running && job.attempts == attempts => {
                job.set_progress(progress);
                job.updated_at = Utc::now();
                Ok(Heartbeat::Owned {
                    cancel_requested: job.cancel_requested,
                })
            }
            _ => Ok(Heartbeat::Lost),
        }
    }

    async fn settle(&self, job: &Job) -> Result<bool, JobQueueError> {
        let retry = {
            let mut state = self.state.lock().await;
            let owned = state
                .jobs
                .get(&job.id)
                .is_some_and(|stored| {
                    stored.state == JobState::Running && stored.attempts == job.attempts
                });
            if !owned {
                return Ok(false);
            }

            // Keep a cancel request made while the final write was in flight.
            let mut next = job.clone();
            if let Some(stored) = state.jobs.get(&job.id) {
                next.cancel_requested |= stored.cancel_requested;
            }
            state.jobs.insert(job.id, next);

            if job.is_settled {
                state.mark_settled(job.id);
                false
            } else {
                state.requeue(job);
                true
            }
        };
        if retry {
            self.wake(&job.queue_name);
        }
        Ok(true)
    }

    async fn reclaim_stale(
        &self,
        queue: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobQueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let stale: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| {
                job.queue_name == queue
                    && job.state == JobState::Running
                    && job.updated_at < stale_before
            })
            .map(|job| job.id)
            .collect();

        let mut reclaimed = Vec::with_capacity(stale.len());
        for id in stale {
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            job.requeue_stale(now);
            let job = job.clone();
            if job.is_settled {
                state.mark_settled(id);
            } else {
                state.requeue(&job);
            }
            reclaimed.push(job);
        }
        drop(state);

        if reclaimed.iter().any(|job| !job.is_settled) {
            self.wake(queue);
        }
        Ok(reclaimed)
    }

    async fn find_one(&self, id: JobId) -> Result<Option<Job>, JobQueueError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn find_many(&self, filter: &JobFilter) -> Result<JobList, JobQueueError> {
        let state = self.state.lock().await;
        let mut total = 0;
        let mut items = Vec::new();
        for job in state.iter_recent().filter(|job| filter.matches(job)) {
            if total >= filter.skip && items.len() < filter.take {
                items.push(job.clone());
            }
            total += 1;
        }
        Ok(JobList { items, total })
    }

    async fn cancel(&self, id: JobId) -> Result<Option<Job>, JobQueueError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };

        if job.state.is_cancellable() {
            job.cancel(Utc::now());
            let job = job.clone();
            state.mark_settled(id);
            Ok(Some(job))
        } else {
            if job.state == JobState::Running {
                job.cancel_requested = true;
            }
            Ok(Some(job.clone()))
        }
    }

    async fn remove_settled(
        &self,
        queue_names: &[String],
        older_than: DateTime<Utc>,
    ) -> Result<u64, JobQueueError> {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            let matches_queue =
                queue_names.is_empty() || queue_names.iter().any(|q| *q == job.queue_name);
            let old = job.settled_at.is_some_and(|at| at < older_than);
            !(job.is_settled && matches_queue && old)
        });
        let removed = before - state.jobs.len();

        if removed > 0 {
            let MemoryState {
                jobs, order, settled, ..
            } = &mut *state;
            order.retain(|id| jobs.contains_key(id));
            settled.retain(|id| jobs.contains_key(id));
        }
        Ok(removed as u64)
    }

    fn wake_signal(&self, queue: &str) -> Option<Arc<Notify>> {
        Some(self.waker(queue))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backoff::BackoffPolicy;
    use serde_json::json;

    #[tokio::test]
    async fn claims_in_creation_order() {
        let strategy = InMemoryJobQueueStrategy::new();
        let first = strategy.add(Job::new("emails", json!(1), 0)).await.unwrap();
        let second = strategy.add(Job::new("emails", json!(2), 0)).await.unwrap();
        strategy.add(Job::new("indexing", json!(3), 0)).await.unwrap();

        let claimed = strategy.claim_next("emails").await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.state, JobState::Running);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.started_at.is_some());

        let claimed = strategy.claim_next("emails").await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
        assert!(strategy.claim_next("emails").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn adding_an_existing_id_returns_the_stored_record() {
        let strategy = InMemoryJobQueueStrategy::new();
        let job = Job::new("emails", json!({"to": "a"}), 0);
        strategy.add(job.clone()).await.unwrap();

        let mut duplicate = job.clone();
        duplicate.data = json!({"to": "b"});
        let stored = strategy.add(duplicate).await.unwrap();
        assert_eq!(stored.data, json!({"to": "a"}));

        let list = strategy.find_many(&JobFilter::default()).await.unwrap();
        assert_eq!(list.total, 1);
    }

    #[tokio::test]
    async fn settle_is_discarded_after_reclaim() {
        let strategy = InMemoryJobQueueStrategy::new();
        strategy.add(Job::new("emails", json!({}), 2)).await.unwrap();
        let mut claimed = strategy.claim_next("emails").await.unwrap().unwrap();

        let reclaimed = strategy
            .reclaim_stale("emails", Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].state, JobState::Pending);
        assert_eq!(reclaimed[0].attempts, 1);

        claimed.complete(json!("late"), Utc::now());
        assert!(!strategy.settle(&claimed).await.unwrap());
        assert_eq!(
            strategy.heartbeat(claimed.id, 1, 10).await.unwrap(),
            Heartbeat::Lost
        );

        let again = strategy.claim_next("emails").await.unwrap().unwrap();
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn retrying_job_is_requeued() {
        let strategy = InMemoryJobQueueStrategy::new();
        strategy.add(Job::new("emails", json!({}), 1)).await.unwrap();
        let mut claimed = strategy.claim_next("emails").await.unwrap().unwrap();
        claimed.fail("boom", &BackoffPolicy::fixed(Duration::ZERO), Utc::now());
        assert!(strategy.settle(&claimed).await.unwrap());

        let retried = strategy.claim_next("emails").await.unwrap().unwrap();
        assert_eq!(retried.id, claimed.id);
        assert_eq!(retried.attempts, 2);
    }

    #[tokio::test]
    async fn cancel_pending_and_running() {
        let strategy = InMemoryJobQueueStrategy::new();
        let pending = strategy.add(Job::new("emails", json!({}), 0)).await.unwrap();
        let running = strategy.add(Job::new("indexing", json!({}), 0)).await.unwrap();
        strategy.claim_next("indexing").await.unwrap().unwrap();

        let cancelled = strategy.cancel(pending.id).await.unwrap().unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);
        assert!(cancelled.is_settled);
        assert!(strategy.claim_next("emails").await.unwrap().is_none());

        let requested = strategy.cancel(running.id).await.unwrap().unwrap();
        assert_eq!(requested.state, JobState::Running);
        assert!(requested.cancel_requested);
        assert_eq!(
            strategy.heartbeat(running.id, 1, 50).await.unwrap(),
            Heartbeat::Owned {
                cancel_requested: true
            }
        );

        // Settled jobs are returned unchanged.
        let again = strategy.cancel(pending.id).await.unwrap().unwrap();
        assert_eq!(again, cancelled);
    }

    #[tokio::test]
    async fn find_many_pages_newest_first() {
        let strategy = InMemoryJobQueueStrategy::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(strategy.add(Job::new("emails", json!(i), 0)).await.unwrap().id);
        }

        let page = strategy
            .find_many(&JobFilter::default().queue("emails").page(1, 2))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.iter().map(|j| j.id).collect::<Vec<_>>(), vec![ids[3], ids[2]]);
    }

    #[tokio::test]
    async fn remove_settled_only_touches_settled_jobs() {
        let strategy = InMemoryJobQueueStrategy::new();
        let done = strategy.add(Job::new("emails", json!({}), 0)).await.unwrap();
        strategy.add(Job::new("emails", json!({}), 0)).await.unwrap();
        strategy.cancel(done.id).await.unwrap();

        let removed = strategy
            .remove_settled(&[], Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(strategy.find_one(done.id).await.unwrap().is_none());
        assert_eq!(strategy.find_many(&JobFilter::default()).await.unwrap().total, 1);
    }
}
