//! Relational reference store on SQLite.
//!
//! Timestamps are stored as integer milliseconds since the epoch so every
//! comparison in the lock and candidate predicates is numeric.

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use tracing::instrument;

use crate::{
    clock::Clock,
    error::StoreError,
    store::{CandidateQuery, ClaimMode, JobStore, LockClaim},
    types::{DateTime, JobId, JobRecord, NewJob, StateCounts},
};

const COLUMNS: &str = "id, priority, attempts, payload, last_error, run_at, locked_at, \
     locked_by, failed_at, first_started_at, last_started_at, finished_at";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    clock: Option<Arc<dyn Clock>>,
}

impl SqliteStore {
    /// Uses the database's own clock.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, clock: None }
    }

    pub fn with_clock(pool: SqlitePool, clock: impl Clock) -> Self {
        Self {
            pool,
            clock: Some(Arc::new(clock)),
        }
    }

    /// Opens a pool on `url`, creating the database file if needed.
    ///
    /// Every connection to `sqlite::memory:` is a separate database, so pass
    /// `max_connections = 1` for in-memory use.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the jobs table and its candidate-scan index when missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deferred_jobs (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                priority         INTEGER NOT NULL DEFAULT 0,
                attempts         INTEGER NOT NULL DEFAULT 0,
                payload          BLOB    NOT NULL,
                last_error       TEXT    NULL,
                run_at           INTEGER NOT NULL,
                locked_at        INTEGER NULL,
                locked_by        TEXT    NULL,
                failed_at        INTEGER NULL,
                first_started_at INTEGER NULL,
                last_started_at  INTEGER NULL,
                finished_at      INTEGER NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS deferred_jobs_priority ON deferred_jobs (priority, run_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Writes everything but the start times. With `holder`, only while that
    /// worker still holds the lease. Returns the affected row count.
    async fn write_fields(
        &self,
        job: &JobRecord,
        holder: Option<&str>,
    ) -> Result<u64, StoreError> {
        let guard = if holder.is_some() {
            "AND locked_by = ?11"
        } else {
            ""
        };

        let sql = format!(
            r#"
            UPDATE deferred_jobs
            SET priority = ?1,
                attempts = ?2,
                payload = ?3,
                last_error = ?4,
                run_at = ?5,
                locked_at = ?6,
                locked_by = ?7,
                failed_at = ?8,
                finished_at = ?9
            WHERE id = ?10 {guard}
            "#
        );

        let mut query = sqlx::query(&sql)
            .bind(job.priority)
            .bind(i64::from(job.attempts))
            .bind(job.payload.to_vec())
            .bind(&job.last_error)
            .bind(to_millis(job.run_at))
            .bind(job.locked_at.map(to_millis))
            .bind(&job.locked_by)
            .bind(job.failed_at.map(to_millis))
            .bind(job.finished_at.map(to_millis))
            .bind(job.id.0);
        if let Some(worker) = holder {
            query = query.bind(worker);
        }

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

fn to_millis(at: DateTime) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::OutOfRange(format!("timestamp {millis}ms")))
}

fn opt_from_millis(millis: Option<i64>) -> Result<Option<DateTime>, StoreError> {
    millis.map(from_millis).transpose()
}

fn row_to_job(row: SqliteRow) -> Result<JobRecord, StoreError> {
    let attempts: i64 = row.try_get("attempts")?;
    let priority: i64 = row.try_get("priority")?;
    let payload: Vec<u8> = row.try_get("payload")?;

    Ok(JobRecord {
        id: JobId(row.try_get("id")?),
        priority: i32::try_from(priority)
            .map_err(|_| StoreError::OutOfRange(format!("priority {priority}")))?,
        attempts: u32::try_from(attempts)
            .map_err(|_| StoreError::OutOfRange(format!("attempts {attempts}")))?,
        payload: payload.into(),
        last_error: row.try_get("last_error")?,
        run_at: from_millis(row.try_get("run_at")?)?,
        locked_at: opt_from_millis(row.try_get("locked_at")?)?,
        locked_by: row.try_get("locked_by")?,
        failed_at: opt_from_millis(row.try_get("failed_at")?)?,
        first_started_at: opt_from_millis(row.try_get("first_started_at")?)?,
        last_started_at: opt_from_millis(row.try_get("last_started_at")?)?,
        finished_at: opt_from_millis(row.try_get("finished_at")?)?,
    })
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn now(&self) -> Result<DateTime, StoreError> {
        let millis: i64 = match &self.clock {
            Some(clock) => to_millis(clock.now()),
            None => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)",
                )
                .fetch_one(&self.pool)
                .await?
            }
        };
        from_millis(millis)
    }

    #[instrument(skip_all, err, fields(job_id, payload_size = job.payload.len()))]
    async fn insert(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        let run_at = match job.run_at {
            Some(run_at) => run_at,
            None => self.now().await?,
        };

        let row = sqlx::query(&format!(
            "INSERT INTO deferred_jobs (priority, attempts, payload, run_at) \
             VALUES (?1, 0, ?2, ?3) RETURNING {COLUMNS}"
        ))
        .bind(job.priority)
        .bind(job.payload.to_vec())
        .bind(to_millis(run_at))
        .fetch_one(&self.pool)
        .await?;

        let record = row_to_job(row)?;
        tracing::Span::current().record("job_id", record.id.0);
        Ok(record)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM deferred_jobs WHERE id = ?1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_job).transpose()
    }

    #[instrument(skip_all, err, fields(worker = %query.worker))]
    async fn fetch_candidates(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let now = self.now().await?;
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM deferred_jobs
            WHERE ((run_at <= ?1 AND (locked_at IS NULL OR locked_at < ?2)) OR locked_by = ?3)
              AND failed_at IS NULL
              AND finished_at IS NULL
              AND (?4 IS NULL OR priority >= ?4)
              AND (?5 IS NULL OR priority <= ?5)
            ORDER BY priority ASC, run_at ASC, id ASC
            LIMIT ?6
            "#
        ))
        .bind(to_millis(now))
        .bind(to_millis(query.expired_before(now)))
        .bind(&query.worker)
        .bind(query.min_priority)
        .bind(query.max_priority)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_job).collect()
    }

    #[instrument(skip_all, err, fields(job_id = %claim.job_id))]
    async fn try_lock(&self, claim: &LockClaim) -> Result<Option<DateTime>, StoreError> {
        let set = "SET locked_at = ?1, \
                   last_started_at = ?1, \
                   locked_by = ?2, \
                   first_started_at = COALESCE(first_started_at, ?1)";

        let row = match claim.mode {
            ClaimMode::Acquire { expired_before } => {
                sqlx::query(&format!(
                    "UPDATE deferred_jobs {set} \
                     WHERE id = ?3 \
                       AND (locked_at IS NULL OR locked_at < ?4) \
                       AND run_at <= ?1 \
                       AND failed_at IS NULL AND finished_at IS NULL \
                     RETURNING first_started_at"
                ))
                .bind(to_millis(claim.now))
                .bind(&claim.worker)
                .bind(claim.job_id.0)
                .bind(to_millis(expired_before))
                .fetch_optional(&self.pool)
                .await?
            }
            ClaimMode::Resume => {
                sqlx::query(&format!(
                    "UPDATE deferred_jobs {set} \
                     WHERE id = ?3 \
                       AND locked_by = ?2 \
                       AND failed_at IS NULL AND finished_at IS NULL \
                     RETURNING first_started_at"
                ))
                .bind(to_millis(claim.now))
                .bind(&claim.worker)
                .bind(claim.job_id.0)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        row.map(|row| -> Result<DateTime, StoreError> {
            from_millis(row.try_get("first_started_at")?)
        })
        .transpose()
    }

    #[instrument(skip_all, err)]
    async fn clear_locks(&self, worker: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE deferred_jobs SET locked_at = NULL, locked_by = NULL WHERE locked_by = ?1",
        )
        .bind(worker)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip_all, err, fields(job_id = %job.id))]
    async fn update(&self, job: &JobRecord) -> Result<(), StoreError> {
        if self.write_fields(job, None).await? == 0 {
            return Err(StoreError::JobNotFound(job.id));
        }
        Ok(())
    }

    #[instrument(skip_all, err, fields(job_id = %job.id, worker = worker))]
    async fn update_held(&self, job: &JobRecord, worker: &str) -> Result<bool, StoreError> {
        Ok(self.write_fields(job, Some(worker)).await? == 1)
    }

    #[instrument(skip_all, err, fields(job_id = %id))]
    async fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM deferred_jobs WHERE id = ?1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip_all, err, fields(job_id = %id, worker = worker))]
    async fn delete_held(&self, id: JobId, worker: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM deferred_jobs WHERE id = ?1 AND locked_by = ?2")
            .bind(id.0)
            .bind(worker)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_all(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM deferred_jobs")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_by_state(&self) -> Result<StateCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN failed_at IS NULL AND finished_at IS NULL
                                   AND locked_at IS NULL THEN 1 ELSE 0 END), 0) AS ready,
                COALESCE(SUM(CASE WHEN failed_at IS NULL AND finished_at IS NULL
                                   AND locked_at IS NULL
                                   AND first_started_at IS NOT NULL THEN 1 ELSE 0 END), 0) AS retrying,
                COALESCE(SUM(CASE WHEN failed_at IS NULL AND finished_at IS NULL
                                   AND locked_at IS NOT NULL THEN 1 ELSE 0 END), 0) AS locked,
                COALESCE(SUM(CASE WHEN failed_at IS NOT NULL THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN failed_at IS NULL
                                   AND finished_at IS NOT NULL THEN 1 ELSE 0 END), 0) AS finished
            FROM deferred_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count = |column: &str| -> Result<u64, StoreError> {
            let value: i64 = row.try_get(column)?;
            Ok(u64::try_from(value).unwrap_or_default())
        };

        Ok(StateCounts {
            ready: count("ready")?,
            retrying: count("retrying")?,
            locked: count("locked")?,
            failed: count("failed")?,
            finished: count("finished")?,
        })
    }
}
