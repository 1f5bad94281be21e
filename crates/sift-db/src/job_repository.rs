use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use sift_core::error::AppError;
use sift_core::job::{
    EnqueueResult, ExtractionJob, JobDiagnostics, JobOutcome, JobStatus, RetryConfig,
    resolve_completion,
};
use sift_core::job_queue::JobQueue;

const STALE_CLAIM_ERROR: &str = "stale claim";

/// PostgreSQL-backed extraction queue using `SELECT FOR UPDATE SKIP LOCKED`.
#[derive(Clone)]
pub struct ExtractionJobRepository {
    pool: Pool<Postgres>,
    retry: RetryConfig,
}

impl ExtractionJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn find_active(
        &self,
        raw_ref: Uuid,
        pipeline_version: &str,
    ) -> Result<Option<Uuid>, AppError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM extraction_jobs
            WHERE raw_ref = $1 AND pipeline_version = $2
              AND status IN ('pending', 'processing')
            "#,
        )
        .bind(raw_ref)
        .bind(pipeline_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::StoreError(e.to_string()))?;

        Ok(row.map(|(id,)| id))
    }
}

#[derive(sqlx::FromRow)]
struct ExtractionJobRow {
    id: Uuid,
    raw_ref: Uuid,
    pipeline_version: String,
    status: String,
    attempt_count: i32,
    max_attempts: i32,
    claimed_at: Option<DateTime<Utc>>,
    available_at: DateTime<Utc>,
    last_error: Option<String>,
    meta: serde_json::Value,
    worker_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<ExtractionJobRow> for ExtractionJob {
    fn from(row: ExtractionJobRow) -> Self {
        ExtractionJob {
            id: row.id,
            raw_ref: row.raw_ref,
            pipeline_version: row.pipeline_version,
            status: row.status.parse().unwrap_or(JobStatus::Pending),
            attempt_count: row.attempt_count.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            claimed_at: row.claimed_at,
            available_at: row.available_at,
            last_error: row.last_error,
            meta: row.meta,
            worker_id: row.worker_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        }
    }
}

impl JobQueue for ExtractionJobRepository {
    async fn enqueue(
        &self,
        raw_ref: Uuid,
        pipeline_version: &str,
    ) -> Result<EnqueueResult, AppError> {
        // The active job can finish between the insert and the lookup; one
        // more round settles it.
        for _ in 0..2 {
            let inserted: Option<(Uuid,)> = sqlx::query_as(
                r#"
                INSERT INTO extraction_jobs (raw_ref, pipeline_version, max_attempts)
                VALUES ($1, $2, $3)
                ON CONFLICT (raw_ref, pipeline_version)
                    WHERE status IN ('pending', 'processing')
                DO NOTHING
                RETURNING id
                "#,
            )
            .bind(raw_ref)
            .bind(pipeline_version)
            .bind(self.retry.max_attempts as i32)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::StoreError(e.to_string()))?;

            if let Some((id,)) = inserted {
                return Ok(EnqueueResult::Created(id));
            }
            if let Some(id) = self.find_active(raw_ref, pipeline_version).await? {
                return Ok(EnqueueResult::Duplicate(id));
            }
        }

        Err(AppError::StoreError(format!(
            "could not enqueue raw unit {raw_ref} for {pipeline_version}"
        )))
    }

    async fn claim(
        &self,
        worker_id: &str,
        batch_size: usize,
        stale_after: Duration,
    ) -> Result<Vec<ExtractionJob>, AppError> {
        let rows = sqlx::query_as::<_, ExtractionJobRow>(
            r#"
            WITH claimable AS (
                SELECT id FROM extraction_jobs
                WHERE (status = 'pending' AND available_at <= NOW())
                   OR (status = 'processing'
                       AND claimed_at < NOW() - make_interval(secs => $3)
                       AND attempt_count < max_attempts)
                ORDER BY available_at ASC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE extraction_jobs j
            SET status = 'processing',
                worker_id = $1,
                claimed_at = NOW(),
                attempt_count = j.attempt_count + 1,
                updated_at = NOW()
            FROM claimable
            WHERE j.id = claimable.id
            RETURNING j.*
            "#,
        )
        .bind(worker_id)
        .bind(batch_size as i64)
        .bind(stale_after.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::StoreError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: &JobOutcome,
        diagnostics: &JobDiagnostics,
    ) -> Result<bool, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::StoreError(e.to_string()))?;

        let held: Option<(i32, i32)> = sqlx::query_as(
            r#"
            SELECT attempt_count, max_attempts FROM extraction_jobs
            WHERE id = $1 AND worker_id = $2 AND status = 'processing'
            FOR UPDATE
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::StoreError(e.to_string()))?;

        let Some((attempt_count, max_attempts)) = held else {
            tracing::debug!(job_id = %job_id, worker_id, "Completion discarded, claim no longer held");
            return Ok(false);
        };

        let completion = resolve_completion(
            attempt_count.max(0) as u32,
            max_attempts.max(0) as u32,
            outcome,
            &self.retry,
            Utc::now(),
        );
        let requeue = completion.is_requeue();

        sqlx::query(
            r#"
            UPDATE extraction_jobs
            SET status = $2,
                attempt_count = $3,
                available_at = COALESCE($4, available_at),
                last_error = $5,
                meta = $6,
                worker_id = CASE WHEN $7 THEN NULL ELSE worker_id END,
                claimed_at = CASE WHEN $7 THEN NULL ELSE claimed_at END,
                completed_at = CASE WHEN $7 THEN NULL ELSE NOW() END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(completion.status.as_str())
        .bind(completion.attempt_count as i32)
        .bind(completion.available_at)
        .bind(&completion.last_error)
        .bind(diagnostics.to_value())
        .bind(requeue)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::StoreError(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| AppError::StoreError(e.to_string()))?;

        Ok(true)
    }

    async fn reclaim_stale(&self, stale_after: Duration) -> Result<u64, AppError> {
        // Right-hand expressions see the pre-update row.
        let result = sqlx::query(
            r#"
            UPDATE extraction_jobs
            SET attempt_count = attempt_count + 1,
                status = CASE WHEN attempt_count + 1 >= max_attempts
                              THEN 'failed' ELSE 'pending' END,
                completed_at = CASE WHEN attempt_count + 1 >= max_attempts
                                    THEN NOW() ELSE NULL END,
                last_error = $2,
                worker_id = NULL,
                claimed_at = NULL,
                available_at = NOW(),
                updated_at = NOW()
            WHERE status = 'processing'
              AND claimed_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(stale_after.as_secs_f64())
        .bind(STALE_CLAIM_ERROR)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::StoreError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn release_job(&self, job_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE extraction_jobs
            SET status = 'pending', worker_id = NULL, claimed_at = NULL,
                attempt_count = GREATEST(attempt_count - 1, 0), updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::StoreError(e.to_string()))?;

        Ok(())
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE extraction_jobs
            SET status = 'pending', worker_id = NULL, claimed_at = NULL,
                attempt_count = GREATEST(attempt_count - 1, 0), updated_at = NOW()
            WHERE worker_id = $1 AND status = 'processing'
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::StoreError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ExtractionJob>, AppError> {
        let row = sqlx::query_as::<_, ExtractionJobRow>(
            r#"SELECT * FROM extraction_jobs WHERE id = $1"#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::StoreError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<ExtractionJob>, AppError> {
        let rows = if let Some(status) = status {
            sqlx::query_as::<_, ExtractionJobRow>(
                r#"
                SELECT * FROM extraction_jobs
                WHERE status = $1
                ORDER BY created_at DESC
                LIMIT $2
                "#,
            )
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, ExtractionJobRow>(
                r#"
                SELECT * FROM extraction_jobs
                ORDER BY created_at DESC
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| AppError::StoreError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM extraction_jobs WHERE status = $1"#)
                .bind(status.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::StoreError(e.to_string()))?;

        Ok(count)
    }
}
