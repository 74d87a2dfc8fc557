//! Core types for the job queue system.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::error::JobQueueError;

/// Identifier of a job record.
pub type JobId = Uuid;

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Retrying,
    Failed,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Retrying,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Returns true if this state represents a settled job.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States from which a cancel request settles the job immediately.
    #[inline]
    pub const fn is_cancellable(self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }

    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Retrying => "RETRYING",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| JobQueueError::UnknownState(s.to_owned()))
    }
}

/// The role a process was started in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Server,
    Worker,
}

impl ProcessRole {
    #[inline]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Worker => "worker",
        }
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessRole {
    type Err = JobQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("server") {
            Ok(Self::Server)
        } else if s.eq_ignore_ascii_case("worker") {
            Ok(Self::Worker)
        } else {
            Err(JobQueueError::InvalidSetting(format!(
                "unknown process role `{s}`"
            )))
        }
    }
}

/// Which process roles dispatch a queue's jobs.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunOn {
    #[default]
    Worker,
    Server,
    Any,
}

impl RunOn {
    #[inline]
    pub const fn includes(self, role: ProcessRole) -> bool {
        match self {
            Self::Any => true,
            Self::Worker => matches!(role, ProcessRole::Worker),
            Self::Server => matches!(role, ProcessRole::Server),
        }
    }
}

impl FromStr for RunOn {
    type Err = JobQueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "worker" => Ok(Self::Worker),
            "server" => Ok(Self::Server),
            "any" | "both" => Ok(Self::Any),
            other => Err(JobQueueError::InvalidSetting(format!(
                "unknown run_on value `{other}`"
            ))),
        }
    }
}

/// Per-queue settings fixed at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Maximum jobs of this queue running at once within one process.
    pub concurrency: usize,
    /// Default retry count for jobs that do not set their own.
    pub retries: u32,
    pub run_on: RunOn,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            retries: 0,
            run_on: RunOn::Worker,
        }
    }
}

impl QueueOptions {
    #[inline]
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[inline]
    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[inline]
    #[must_use]
    pub const fn with_run_on(mut self, run_on: RunOn) -> Self {
        self.run_on = run_on;
        self
    }
}

/// Options accepted by [`JobQueue::add`](crate::JobQueue::add).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub retries: Option<u32>,
    /// Caller-chosen id. Adding a job whose id already exists returns the existing record.
    pub job_id: Option<JobId>,
}

impl JobOptions {
    #[inline]
    #[must_use]
    pub const fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    #[inline]
    #[must_use]
    pub const fn job_id(mut self, id: JobId) -> Self {
        self.job_id = Some(id);
        self
    }
}

/// A durable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    pub data: Value,
    pub state: JobState,
    pub progress: u8,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retries: u32,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub is_settled: bool,
    /// Earliest instant a RETRYING job may be claimed again.
    pub retry_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
}

impl Job {
    /// Create a new pending job.
    #[inline]
    pub fn new(queue_name: impl Into<String>, data: Value, retries: u32) -> Self {
        Self::with_id(Uuid::new_v4(), queue_name, data, retries)
    }

    /// Create a new pending job with a specific ID.
    pub fn with_id(id: JobId, queue_name: impl Into<String>, data: Value, retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            queue_name: queue_name.into(),
            data,
            state: JobState::Pending,
            progress: 0,
            result: None,
            error: None,
            retries,
            attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            settled_at: None,
            is_settled: false,
            retry_at: None,
            cancel_requested: false,
        }
    }

    /// Whether another execution attempt is allowed.
    #[inline]
    pub const fn has_attempts_left(&self) -> bool {
        self.attempts < self.retries.saturating_add(1)
    }

    /// Whether a dispatch loop may claim this job at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        if !self.has_attempts_left() {
            return false;
        }
        match self.state {
            JobState::Pending => true,
            JobState::Retrying => self.retry_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    /// Transition to RUNNING as part of a claim.
    pub fn start(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Running;
        self.attempts += 1;
        self.started_at.get_or_insert(now);
        self.retry_at = None;
        self.updated_at = now;
    }

    #[inline]
    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
    }

    /// Mark the job as completed with the processor's result.
    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.error = None;
        self.settle(now);
    }

    /// Record a failed attempt. Moves to RETRYING while attempts remain, otherwise FAILED.
    pub fn fail(&mut self, message: impl Into<String>, backoff: &BackoffPolicy, now: DateTime<Utc>) {
        self.progress = 0;
        self.result = None;
        if self.has_attempts_left() {
            let delay = backoff.delay(self.attempts, self.jitter_seed());
            self.state = JobState::Retrying;
            self.retry_at = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.updated_at = now;
        } else {
            self.state = JobState::Failed;
            self.error = Some(message.into());
            self.settle(now);
        }
    }

    /// Settle the job as cancelled.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Cancelled;
        self.result = None;
        self.error = None;
        self.settle(now);
    }

    /// Requeue a RUNNING job whose owner stopped heartbeating. The interrupted
    /// attempt stays counted; if it was the last one the job fails. A job
    /// with a pending cancel request is cancelled instead of requeued.
    pub fn requeue_stale(&mut self, now: DateTime<Utc>) {
        self.progress = 0;
        if self.cancel_requested {
            self.cancel(now);
        } else if self.has_attempts_left() {
            self.state = JobState::Pending;
            self.updated_at = now;
        } else {
            self.state = JobState::Failed;
            self.error = Some("job stalled: no heartbeat before the stale timeout".to_owned());
            self.settle(now);
        }
    }

    fn settle(&mut self, now: DateTime<Utc>) {
        self.is_settled = true;
        self.retry_at = None;
        if self.settled_at.is_none() {
            self.settled_at = Some(now);
        }
        self.updated_at = now;
    }

    #[inline]
    fn jitter_seed(&self) -> u64 {
        (self.id.as_u128() as u64) ^ u64::from(self.attempts)
    }
}

/// Criteria for [`JobQueueStrategy::find_many`](crate::JobQueueStrategy::find_many).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    /// Empty means every queue.
    pub queue_names: Vec<String>,
    /// Empty means every state.
    pub states: Vec<JobState>,
    pub settled: Option<bool>,
    /// Empty means every id.
    pub ids: Vec<JobId>,
    pub skip: usize,
    pub take: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            queue_names: Vec::new(),
            states: Vec::new(),
            settled: None,
            ids: Vec::new(),
            skip: 0,
            take: 50,
        }
    }
}

impl JobFilter {
    #[must_use]
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue_names.push(name.into());
        self
    }

    #[must_use]
    pub fn state(mut self, state: JobState) -> Self {
        self.states.push(state);
        self
    }

    #[must_use]
    pub const fn settled(mut self, settled: bool) -> Self {
        self.settled = Some(settled);
        self
    }

    #[must_use]
    pub const fn page(mut self, skip: usize, take: usize) -> Self {
        self.skip = skip;
        self.take = take;
        self
    }

    /// Whether a job satisfies every criterion except paging.
    pub fn matches(&self, job: &Job) -> bool {
        (self.queue_names.is_empty() || self.queue_names.iter().any(|q| *q == job.queue_name))
            && (self.states.is_empty() || self.states.contains(&job.state))
            && self.settled.map_or(true, |settled| settled == job.is_settled)
            && (self.ids.is_empty() || self.ids.contains(&job.id))
    }
}

/// A page of jobs plus the total number matching the filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobList {
    pub items: Vec<Job>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use serde_json::json;

    fn no_delay() -> BackoffPolicy {
        BackoffPolicy::fixed(Duration::ZERO)
    }

    #[test]
    fn state_round_trips_through_strings() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("sleeping".parse::<JobState>().is_err());
    }

    #[test]
    fn failing_twice_with_one_retry_fails_terminally() {
        let now = Utc::now();
        let mut job = Job::new("emails", json!({}), 1);

        job.start(now);
        job.fail("boom", &no_delay(), now);
        assert_eq!(job.state, JobState::Retrying);
        assert!(job.error.is_none());
        assert!(!job.is_settled);
        assert!(job.is_claimable_at(now));

        job.start(now);
        job.fail("boom again", &no_delay(), now);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.error.as_deref(), Some("boom again"));
        assert!(job.result.is_none());
        assert!(job.is_settled);
        assert!(!job.is_claimable_at(now));
    }

    #[test]
    fn retrying_job_waits_for_backoff() {
        let now = Utc::now();
        let mut job = Job::new("emails", json!({}), 3);
        job.start(now);
        job.fail("boom", &BackoffPolicy::fixed(Duration::from_secs(30)), now);

        assert!(!job.is_claimable_at(now));
        assert!(job.is_claimable_at(now + chrono::Duration::seconds(31)));
    }

    #[test]
    fn started_at_is_not_reset_on_retry() {
        let first = Utc::now();
        let mut job = Job::new("emails", json!({}), 1);
        job.start(first);
        job.fail("boom", &no_delay(), first);
        job.start(first + chrono::Duration::seconds(5));
        assert_eq!(job.started_at, Some(first));
    }

    #[test]
    fn complete_sets_result_and_settles() {
        let now = Utc::now();
        let mut job = Job::new("emails", json!({}), 0);
        job.start(now);
        job.complete(json!({"sent": true}), now);
        assert_eq!(job.state, JobState::Completed);
        assert!(job.is_settled);
        assert_eq!(job.result, Some(json!({"sent": true})));
        assert!(job.error.is_none());
        assert!(job.settled_at >= job.started_at);
    }

    #[test]
    fn stale_requeue_keeps_the_attempt() {
        let now = Utc::now();
        let mut job = Job::new("indexing", json!({}), 2);
        job.start(now);
        job.requeue_stale(now);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);

        let mut last = Job::new("indexing", json!({}), 0);
        last.start(now);
        last.requeue_stale(now);
        assert_eq!(last.state, JobState::Failed);
        assert!(last.is_settled);
        assert!(last.error.is_some());
    }

    #[test]
    fn stale_job_with_cancel_request_settles_as_cancelled() {
        let now = Utc::now();
        let mut job = Job::new("indexing", json!({}), 2);
        job.start(now);
        job.cancel_requested = true;
        job.requeue_stale(now);
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.is_settled);
        assert!(job.error.is_none());
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn run_on_matches_roles() {
        assert!(RunOn::Any.includes(ProcessRole::Server));
        assert!(RunOn::Worker.includes(ProcessRole::Worker));
        assert!(!RunOn::Worker.includes(ProcessRole::Server));
        assert_eq!("both".parse::<RunOn>().unwrap(), RunOn::Any);
    }

    #[test]
    fn filter_matches_queue_and_state() {
        let job = Job::new("emails", json!({}), 0);
        assert!(JobFilter::default().matches(&job));
        assert!(JobFilter::default().queue("emails").matches(&job));
        assert!(!JobFilter::default().queue("indexing").matches(&job));
        assert!(!JobFilter::default().state(JobState::Running).matches(&job));
        assert!(JobFilter::default().settled(false).matches(&job));
    }
}
