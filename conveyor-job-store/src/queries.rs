// Query functions over the `job_records` table.
// Each takes any SQLite executor so callers can run them on a pool or inside a transaction.

pub mod job_records {
    use conveyor_job_queue::{JobFilter, JobState};
    use sqlx::{Executor, QueryBuilder, Sqlite};

    use crate::row::JobRecordRow;

    /// States a claim may start from.
    const CLAIMABLE: &str = "(state = 'PENDING' OR (state = 'RETRYING' AND (retry_at IS NULL OR retry_at <= ?))) \
         AND attempts < retries + 1";

    pub async fn insert<'e, E>(executor: E, row: &JobRecordRow) -> Result<bool, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO job_records (
                id, queue_name, data, state, progress, result, error, retries, attempts,
                created_at, updated_at, started_at, settled_at, is_settled, retry_at, cancel_requested
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&row.id)
        .bind(&row.queue_name)
        .bind(&row.data)
        .bind(&row.state)
        .bind(row.progress)
        .bind(&row.result)
        .bind(&row.error)
        .bind(row.retries)
        .bind(row.attempts)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.started_at)
        .bind(row.settled_at)
        .bind(row.is_settled)
        .bind(row.retry_at)
        .bind(row.cancel_requested)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn find_by_id<'e, E>(executor: E, id: &str) -> Result<Option<JobRecordRow>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, JobRecordRow>("SELECT * FROM job_records WHERE id = ?")
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    /// Ids of the oldest claimable jobs of `queue`.
    pub async fn claim_candidates<'e, E>(
        executor: E,
        queue: &str,
        now: i64,
        limit: u32,
    ) -> Result<Vec<String>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT id FROM job_records WHERE queue_name = ? AND {CLAIMABLE} \
             ORDER BY created_at, rowid LIMIT ?"
        );
        sqlx::query_scalar(&sql)
            .bind(queue)
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(executor)
            .await
    }

    /// Compare-and-swap a claimable job to RUNNING. Returns `None` when
    /// another poller got there first.
    pub async fn try_claim<'e, E>(
        executor: E,
        id: &str,
        now: i64,
    ) -> Result<Option<JobRecordRow>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "UPDATE job_records \
             SET state = 'RUNNING', attempts = attempts + 1, started_at = COALESCE(started_at, ?), \
                 retry_at = NULL, updated_at = ? \
             WHERE id = ? AND {CLAIMABLE} \
             RETURNING *"
        );
        sqlx::query_as::<_, JobRecordRow>(&sql)
            .bind(now)
            .bind(now)
            .bind(id)
            .bind(now)
            .fetch_optional(executor)
            .await
    }

    /// Refresh a running job. Returns its `cancel_requested` flag, or `None`
    /// if it is no longer running under `attempts`.
    pub async fn heartbeat<'e, E>(
        executor: E,
        id: &str,
        attempts: i64,
        progress: i64,
        now: i64,
    ) -> Result<Option<bool>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_scalar(
            r#"
            UPDATE job_records SET updated_at = ?, progress = ?
            WHERE id = ? AND state = 'RUNNING' AND attempts = ?
            RETURNING cancel_requested
            "#,
        )
        .bind(now)
        .bind(progress)
        .bind(id)
        .bind(attempts)
        .fetch_optional(executor)
        .await
    }

    /// Write the outcome of an attempt if the job is still running under the
    /// same attempt number. `expected_updated_at` additionally pins the
    /// heartbeat timestamp when given.
    pub async fn settle<'e, E>(
        executor: E,
        row: &JobRecordRow,
        expected_updated_at: Option<i64>,
    ) -> Result<bool, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET state = ?, progress = ?, result = ?, error = ?, updated_at = ?,
                settled_at = ?, is_settled = ?, retry_at = ?,
                cancel_requested = MAX(cancel_requested, ?)
            WHERE id = ? AND state = 'RUNNING' AND attempts = ?
              AND (? IS NULL OR updated_at = ?)
            "#,
        )
        .bind(&row.state)
        .bind(row.progress)
        .bind(&row.result)
        .bind(&row.error)
        .bind(row.updated_at)
        .bind(row.settled_at)
        .bind(row.is_settled)
        .bind(row.retry_at)
        .bind(row.cancel_requested)
        .bind(&row.id)
        .bind(row.attempts)
        .bind(expected_updated_at)
        .bind(expected_updated_at)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// RUNNING jobs of `queue` whose last heartbeat is before `stale_before`.
    pub async fn find_stale<'e, E>(
        executor: E,
        queue: &str,
        stale_before: i64,
    ) -> Result<Vec<JobRecordRow>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_as::<_, JobRecordRow>(
            "SELECT * FROM job_records WHERE queue_name = ? AND state = 'RUNNING' AND updated_at < ? \
             ORDER BY created_at, rowid",
        )
        .bind(queue)
        .bind(stale_before)
        .fetch_all(executor)
        .await
    }

    /// Settle a PENDING or RETRYING job as CANCELLED.
    pub async fn cancel_waiting<'e, E>(executor: E, id: &str, now: i64) -> Result<bool, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET state = 'CANCELLED', result = NULL, error = NULL, retry_at = NULL,
                is_settled = 1, settled_at = COALESCE(settled_at, ?), updated_at = ?
            WHERE id = ? AND state IN ('PENDING', 'RETRYING')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Flag a RUNNING job for cooperative cancellation.
    pub async fn request_cancel<'e, E>(executor: E, id: &str) -> Result<bool, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            "UPDATE job_records SET cancel_requested = 1 WHERE id = ? AND state = 'RUNNING'",
        )
        .bind(id)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    fn push_filter<'a>(builder: &mut QueryBuilder<'a, Sqlite>, filter: &'a JobFilter) {
        builder.push(" WHERE 1 = 1");
        if !filter.queue_names.is_empty() {
            builder.push(" AND queue_name IN (");
            let mut list = builder.separated(", ");
            for name in &filter.queue_names {
                list.push_bind(name.as_str());
            }
            list.push_unseparated(")");
        }
        if !filter.states.is_empty() {
            builder.push(" AND state IN (");
            let mut list = builder.separated(", ");
            for state in &filter.states {
                list.push_bind(JobState::as_str(*state));
            }
            list.push_unseparated(")");
        }
        if let Some(settled) = filter.settled {
            builder.push(" AND is_settled = ").push_bind(settled);
        }
        if !filter.ids.is_empty() {
            builder.push(" AND id IN (");
            let mut list = builder.separated(", ");
            for id in &filter.ids {
                list.push_bind(id.to_string());
            }
            list.push_unseparated(")");
        }
    }

    pub async fn count<'e, E>(executor: E, filter: &JobFilter) -> Result<i64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM job_records");
        push_filter(&mut builder, filter);
        builder.build_query_scalar().fetch_one(executor).await
    }

    /// Matching rows, newest first.
    pub async fn find_many<'e, E>(
        executor: E,
        filter: &JobFilter,
    ) -> Result<Vec<JobRecordRow>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let mut builder = QueryBuilder::new("SELECT * FROM job_records");
        push_filter(&mut builder, filter);
        builder
            .push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
            .push_bind(i64::try_from(filter.take).unwrap_or(i64::MAX))
            .push(" OFFSET ")
            .push_bind(i64::try_from(filter.skip).unwrap_or(i64::MAX));
        builder.build_query_as().fetch_all(executor).await
    }

    pub async fn remove_settled<'e, E>(
        executor: E,
        queue_names: &[String],
        older_than: i64,
    ) -> Result<u64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let mut builder =
            QueryBuilder::new("DELETE FROM job_records WHERE is_settled = 1 AND settled_at < ");
        builder.push_bind(older_than);
        if !queue_names.is_empty() {
            builder.push(" AND queue_name IN (");
            let mut list = builder.separated(", ");
            for name in queue_names {
                list.push_bind(name.as_str());
            }
            list.push_unseparated(")");
        }
        let result = builder.build().execute(executor).await?;
        Ok(result.rows_affected())
    }
}
