use std::future::Future;
use std::time::Duration;

use uuid::Uuid;

use crate::error::AppError;
use crate::job::{EnqueueResult, ExtractionJob, JobDiagnostics, JobOutcome, JobStatus};

/// Durable queue of extraction jobs.
///
/// Implementations must claim atomically (`SELECT FOR UPDATE SKIP LOCKED`
/// or equivalent) so that concurrent callers never receive the same job.
/// Store-connectivity failures surface as [`AppError::StoreError`].
pub trait JobQueue: Send + Sync + Clone {
    /// Enqueue work for a raw unit under a pipeline version.
    ///
    /// A no-op returning [`EnqueueResult::Duplicate`] while a non-terminal
    /// job for the same `(raw_ref, pipeline_version)` exists.
    fn enqueue(
        &self,
        raw_ref: Uuid,
        pipeline_version: &str,
    ) -> impl Future<Output = Result<EnqueueResult, AppError>> + Send;

    /// Atomically claim up to `batch_size` jobs for `worker_id`.
    ///
    /// Picks due `pending` rows and `processing` rows whose claim is older
    /// than `stale_after`. Claimed rows move to `processing` with
    /// `claimed_at = now` and `attempt_count + 1`.
    fn claim(
        &self,
        worker_id: &str,
        batch_size: usize,
        stale_after: Duration,
    ) -> impl Future<Output = Result<Vec<ExtractionJob>, AppError>> + Send;

    /// Record the outcome of a claimed job.
    ///
    /// Failed jobs below `max_attempts` return to `pending` after the
    /// backoff delay. Returns `false` when `worker_id` no longer holds the
    /// job (it was reclaimed as stale in the meantime).
    fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: &JobOutcome,
        diagnostics: &JobDiagnostics,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Reset abandoned `processing` jobs back to `pending`, charging an
    /// attempt. Jobs that run out of attempts become terminally `failed`.
    fn reclaim_stale(
        &self,
        stale_after: Duration,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Return a claimed job to `pending` without charging the attempt.
    fn release_job(&self, job_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Release all jobs held by a specific worker (for graceful shutdown).
    fn release_worker_jobs(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn get_job(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Option<ExtractionJob>, AppError>> + Send;

    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ExtractionJob>, AppError>> + Send;

    fn count_by_status(
        &self,
        status: JobStatus,
    ) -> impl Future<Output = Result<i64, AppError>> + Send;
}
