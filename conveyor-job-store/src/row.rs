use chrono::{DateTime, Utc};
use conveyor_job_queue::{Job, JobState};
use uuid::Uuid;

use crate::error::StoreError;

/// A `job_records` row as stored. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct JobRecordRow {
    pub id: String,
    pub queue_name: String,
    pub data: String,
    pub state: String,
    pub progress: i64,
    pub result: Option<String>,
    pub error: Option<String>,
    pub retries: i64,
    pub attempts: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub settled_at: Option<i64>,
    pub is_settled: bool,
    pub retry_at: Option<i64>,
    pub cancel_requested: bool,
}

impl JobRecordRow {
    pub fn from_job(job: &Job) -> Result<Self, StoreError> {
        Ok(Self {
            id: job.id.to_string(),
            queue_name: job.queue_name.clone(),
            data: serde_json::to_string(&job.data)?,
            state: job.state.as_str().to_owned(),
            progress: i64::from(job.progress),
            result: job.result.as_ref().map(serde_json::to_string).transpose()?,
            error: job.error.clone(),
            retries: i64::from(job.retries),
            attempts: i64::from(job.attempts),
            created_at: millis(job.created_at),
            updated_at: millis(job.updated_at),
            started_at: job.started_at.map(millis),
            settled_at: job.settled_at.map(millis),
            is_settled: job.is_settled,
            retry_at: job.retry_at.map(millis),
            cancel_requested: job.cancel_requested,
        })
    }
}

impl TryFrom<JobRecordRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRecordRow) -> Result<Self, Self::Error> {
        let decode = |reason: String| StoreError::Decode {
            id: row.id.clone(),
            reason,
        };

        let id = Uuid::parse_str(&row.id).map_err(|e| decode(e.to_string()))?;
        let state: JobState = row.state.parse().map_err(|e| decode(format!("{e}")))?;
        let timestamp = |ms: i64| {
            DateTime::<Utc>::from_timestamp_millis(ms)
                .ok_or_else(|| decode(format!("timestamp {ms} out of range")))
        };
        let count = |value: i64, field: &str| {
            u32::try_from(value).map_err(|_| decode(format!("{field} {value} out of range")))
        };

        Ok(Job {
            id,
            queue_name: row.queue_name.clone(),
            data: serde_json::from_str(&row.data)?,
            state,
            progress: u8::try_from(row.progress.clamp(0, 100)).unwrap_or(100),
            result: row.result.as_deref().map(serde_json::from_str).transpose()?,
            error: row.error.clone(),
            retries: count(row.retries, "retries")?,
            attempts: count(row.attempts, "attempts")?,
            created_at: timestamp(row.created_at)?,
            updated_at: timestamp(row.updated_at)?,
            started_at: row.started_at.map(timestamp).transpose()?,
            settled_at: row.settled_at.map(timestamp).transpose()?,
            is_settled: row.is_settled,
            retry_at: row.retry_at.map(timestamp).transpose()?,
            cancel_requested: row.cancel_requested,
        })
    }
}

#[inline]
pub(crate) fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}
