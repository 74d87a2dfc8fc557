use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_db_connection::{create_pool, DbConnectionConfig, DbPool};
use conveyor_job_queue::{
    Heartbeat, Job, JobFilter, JobId, JobList, JobQueueError, JobQueueStrategy,
};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::queries::job_records;
use crate::row::{millis, JobRecordRow};

/// Candidates fetched per poll before trying to claim them one by one.
pub const DEFAULT_CLAIM_BATCH: u32 = 10;

/// Polling strategy over the `job_records` table.
///
/// Pollers in any number of processes can share the database. Each claim is
/// an `UPDATE ... WHERE <still claimable> RETURNING *`; losing that race to
/// another poller just moves on to the next candidate.
#[derive(Clone)]
pub struct SqlJobQueueStrategy {
    pool: DbPool,
    claim_batch: u32,
}

impl fmt::Debug for SqlJobQueueStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlJobQueueStrategy")
            .field("pool", &"<SqlitePool>")
            .field("claim_batch", &self.claim_batch)
            .finish()
    }
}

impl SqlJobQueueStrategy {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            claim_batch: DEFAULT_CLAIM_BATCH,
        }
    }

    /// Open the pool described by `config` and apply pending migrations.
    pub async fn connect(config: &DbConnectionConfig) -> Result<Self, StoreError> {
        let pool = create_pool(config).await?;
        conveyor_migrations::run_migrations(&pool).await?;
        info!("job store ready");
        Ok(Self::new(pool))
    }

    #[must_use]
    pub fn with_claim_batch(mut self, claim_batch: u32) -> Self {
        self.claim_batch = claim_batch.max(1);
        self
    }

    #[inline]
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn load(&self, id: &str) -> Result<Option<Job>, StoreError> {
        job_records::find_by_id(&self.pool, id)
            .await?
            .map(Job::try_from)
            .transpose()
    }
}

#[async_trait]
impl JobQueueStrategy for SqlJobQueueStrategy {
    async fn add(&self, job: Job) -> Result<Job, JobQueueError> {
        let row = JobRecordRow::from_job(&job).map_err(StoreError::from)?;
        if job_records::insert(&self.pool, &row)
            .await
            .map_err(StoreError::from)?
        {
            return Ok(job);
        }
        debug!(job_id = %job.id, "job id already stored; returning the existing record");
        Ok(self.load(&row.id).await?.unwrap_or(job))
    }

    async fn claim_next(&self, queue: &str) -> Result<Option<Job>, JobQueueError> {
        let now = millis(Utc::now());
        let candidates = job_records::claim_candidates(&self.pool, queue, now, self.claim_batch)
            .await
            .map_err(StoreError::from)?;

        for id in candidates {
            match job_records::try_claim(&self.pool, &id, now)
                .await
                .map_err(StoreError::from)?
            {
                Some(row) => return Ok(Some(Job::try_from(row)?)),
                None => {
                    if let Ok(job_id) = id.parse::<JobId>() {
                        debug!(queue, "{}", JobQueueError::ClaimConflict(job_id));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn heartbeat(
        &self,
        id: JobId,
        attempts: u32,
        progress: u8,
    ) -> Result<Heartbeat, JobQueueError> {
        let cancel_requested = job_records::heartbeat(
            &self.pool,
            &id.to_string(),
            i64::from(attempts),
            i64::from(progress),
            millis(Utc::now()),
        )
        .await
        .map_err(StoreError::from)?;

        Ok(match cancel_requested {
            Some(cancel_requested) => Heartbeat::Owned { cancel_requested },
            None => Heartbeat::Lost,
        })
    }

    async fn settle(&self, job: &Job) -> Result<bool, JobQueueError> {
        let row = JobRecordRow::from_job(job).map_err(StoreError::from)?;
        Ok(job_records::settle(&self.pool, &row, None)
            .await
            .map_err(StoreError::from)?)
    }

    async fn reclaim_stale(
        &self,
        queue: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobQueueError> {
        let rows = job_records::find_stale(&self.pool, queue, millis(stale_before))
            .await
            .map_err(StoreError::from)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in rows {
            let last_heartbeat = row.updated_at;
            let mut job = Job::try_from(row)?;
            job.requeue_stale(now);

            let next = JobRecordRow::from_job(&job).map_err(StoreError::from)?;
            // Pinning the old heartbeat makes a concurrent reclaim or a late
            // heartbeat win over this one.
            if job_records::settle(&self.pool, &next, Some(last_heartbeat))
                .await
                .map_err(StoreError::from)?
            {
                reclaimed.push(job);
            }
        }
        Ok(reclaimed)
    }

    async fn find_one(&self, id: JobId) -> Result<Option<Job>, JobQueueError> {
        Ok(self.load(&id.to_string()).await?)
    }

    async fn find_many(&self, filter: &JobFilter) -> Result<JobList, JobQueueError> {
        let total = job_records::count(&self.pool, filter)
            .await
            .map_err(StoreError::from)?;
        let rows = job_records::find_many(&self.pool, filter)
            .await
            .map_err(StoreError::from)?;
        let items = rows
            .into_iter()
            .map(Job::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JobList {
            items,
            total: usize::try_from(total).unwrap_or(0),
        })
    }

    async fn cancel(&self, id: JobId) -> Result<Option<Job>, JobQueueError> {
        let key = id.to_string();
        let now = millis(Utc::now());
        let cancelled = job_records::cancel_waiting(&self.pool, &key, now)
            .await
            .map_err(StoreError::from)?;
        if !cancelled {
            job_records::request_cancel(&self.pool, &key)
                .await
                .map_err(StoreError::from)?;
        }
        Ok(self.load(&key).await?)
    }

    async fn remove_settled(
        &self,
        queue_names: &[String],
        older_than: DateTime<Utc>,
    ) -> Result<u64, JobQueueError> {
        Ok(
            job_records::remove_settled(&self.pool, queue_names, millis(older_than))
                .await
                .map_err(StoreError::from)?,
        )
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
