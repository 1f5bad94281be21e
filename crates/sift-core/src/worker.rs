use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{ExtractionJob, JobDiagnostics, JobOutcome, JobStatus, RetryMode, Stage, WorkerConfig};
use crate::job_queue::JobQueue;
use crate::pipeline::{ExtractionPipeline, PipelineReport};
use crate::traits::{Extractor, GroupStore, RawUnitStore, RecordStore};

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Started {
        worker_id: String,
    },
    Polling,
    BatchClaimed {
        count: usize,
    },
    JobStarted {
        job_id: Uuid,
        raw_ref: Uuid,
        attempt: u32,
    },
    JobFinished {
        job_id: Uuid,
        status: JobStatus,
    },
    JobRequeued {
        job_id: Uuid,
        error: String,
    },
    StoreUnavailable {
        error: String,
        backoff: Duration,
    },
    StaleReclaimed {
        count: u64,
    },
    ShuttingDown {
        worker_id: String,
        jobs_released: u64,
    },
    Stopped {
        worker_id: String,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling => {
                tracing::debug!("Polling for jobs");
            }
            WorkerEvent::BatchClaimed { count } => {
                tracing::info!(%count, "Batch claimed");
            }
            WorkerEvent::JobStarted {
                job_id,
                raw_ref,
                attempt,
            } => {
                tracing::info!(%job_id, %raw_ref, %attempt, "Processing job");
            }
            WorkerEvent::JobFinished { job_id, status } => {
                tracing::info!(%job_id, %status, "Job finished");
            }
            WorkerEvent::JobRequeued { job_id, error } => {
                tracing::warn!(%job_id, %error, "Job requeued");
            }
            WorkerEvent::StoreUnavailable { error, backoff } => {
                tracing::error!(%error, ?backoff, "Store unavailable, backing off");
            }
            WorkerEvent::StaleReclaimed { count } => {
                tracing::warn!(%count, "Reclaimed stale jobs");
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                jobs_released,
            } => {
                tracing::info!(%worker_id, %jobs_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// A terminally failed job, with enough context to triage it by hand.
#[derive(Debug, Clone, PartialEq)]
pub struct TriageReport {
    pub job_id: Uuid,
    pub raw_ref: Uuid,
    pub attempt_count: u32,
    pub stage: Option<Stage>,
    pub error: Option<String>,
    pub raw_snippet: Option<String>,
}

/// Destination for terminally failed jobs.
pub trait TriageSink: Send + Sync {
    fn surface(&self, report: TriageReport);
}

/// Triage sink that logs at `error` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTriageSink;

impl TriageSink for TracingTriageSink {
    fn surface(&self, report: TriageReport) {
        tracing::error!(
            job_id = %report.job_id,
            raw_ref = %report.raw_ref,
            attempts = report.attempt_count,
            stage = report.stage.map(|s| s.as_str()).unwrap_or("unknown"),
            error = report.error.as_deref().unwrap_or(""),
            snippet = report.raw_snippet.as_deref().unwrap_or(""),
            "Job failed terminally"
        );
    }
}

/// Worker that polls the job queue and runs claimed jobs through the
/// extraction pipeline.
pub struct WorkerService<Q, U, E, R, G>
where
    Q: JobQueue,
    U: RawUnitStore,
    E: Extractor,
    R: RecordStore,
    G: GroupStore,
{
    queue: Q,
    raw_units: U,
    pipeline: ExtractionPipeline<E, R, G>,
    config: WorkerConfig,
}

impl<Q, U, E, R, G> WorkerService<Q, U, E, R, G>
where
    Q: JobQueue,
    U: RawUnitStore,
    E: Extractor,
    R: RecordStore,
    G: GroupStore,
{
    pub fn new(
        queue: Q,
        raw_units: U,
        pipeline: ExtractionPipeline<E, R, G>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            raw_units,
            pipeline,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run the worker loop until cancellation.
    ///
    /// Store failures never reach the caller: the loop backs off and tries
    /// again, so only cancellation ends it.
    pub async fn run<WR: WorkerReporter, T: TriageSink>(
        &self,
        cancel_token: CancellationToken,
        reporter: &WR,
        triage: &T,
    ) -> Result<(), AppError> {
        reporter.report(WorkerEvent::Started {
            worker_id: self.config.worker_id.clone(),
        });

        let mut store_failures: u32 = 0;
        let mut last_reclaim: Option<Instant> = None;

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            if last_reclaim.is_none_or(|at| at.elapsed() >= self.config.reclaim_interval) {
                last_reclaim = Some(Instant::now());
                match self.queue.reclaim_stale(self.config.stale_after).await {
                    Ok(0) => {}
                    Ok(count) => reporter.report(WorkerEvent::StaleReclaimed { count }),
                    Err(e) => tracing::warn!(error = %e, "Stale reclaim failed"),
                }
            }

            let wait = match self.run_once(reporter, triage).await {
                Ok(0) => {
                    store_failures = 0;
                    self.config.poll_interval
                }
                Ok(_) => {
                    store_failures = 0;
                    continue;
                }
                Err(e) => {
                    store_failures = store_failures.saturating_add(1);
                    let backoff = self.config.store_backoff(store_failures);
                    reporter.report(WorkerEvent::StoreUnavailable {
                        error: e.to_string(),
                        backoff,
                    });
                    backoff
                }
            };

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = cancel_token.cancelled() => break,
            }
        }

        // Graceful shutdown: release anything still claimed by this worker
        let released = self
            .queue
            .release_worker_jobs(&self.config.worker_id)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "Failed to release jobs on shutdown");
                0
            });

        reporter.report(WorkerEvent::ShuttingDown {
            worker_id: self.config.worker_id.clone(),
            jobs_released: released,
        });
        reporter.report(WorkerEvent::Stopped {
            worker_id: self.config.worker_id.clone(),
        });

        Ok(())
    }

    /// Claim one batch and process it with bounded concurrency.
    ///
    /// Returns the number of jobs claimed, or the store error that cut the
    /// batch short.
    pub async fn run_once<WR: WorkerReporter, T: TriageSink>(
        &self,
        reporter: &WR,
        triage: &T,
    ) -> Result<usize, AppError> {
        reporter.report(WorkerEvent::Polling);

        let jobs = self
            .queue
            .claim(
                &self.config.worker_id,
                self.config.batch_size,
                self.config.stale_after,
            )
            .await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        let count = jobs.len();
        reporter.report(WorkerEvent::BatchClaimed { count });

        // First store error seen in this batch; later jobs are released untouched.
        let store_error: Mutex<Option<AppError>> = Mutex::new(None);
        futures::stream::iter(jobs)
            .for_each_concurrent(self.config.concurrency, |job| {
                let store_error = &store_error;
                async move {
                    if store_error.lock().is_ok_and(|slot| slot.is_some()) {
                        self.release(&job).await;
                        return;
                    }
                    if let Err(e) = self.process_job(&job, reporter, triage).await
                        && let Ok(mut slot) = store_error.lock()
                    {
                        slot.get_or_insert(e);
                    }
                }
            })
            .await;

        match store_error.into_inner().ok().flatten() {
            Some(e) => Err(e),
            None => Ok(count),
        }
    }

    /// Run one claimed job to a recorded outcome.
    ///
    /// A store error releases the job without charging the attempt and is
    /// returned so the loop can back off.
    async fn process_job<WR: WorkerReporter, T: TriageSink>(
        &self,
        job: &ExtractionJob,
        reporter: &WR,
        triage: &T,
    ) -> Result<(), AppError> {
        reporter.report(WorkerEvent::JobStarted {
            job_id: job.id,
            raw_ref: job.raw_ref,
            attempt: job.attempt_count,
        });

        let report = match self.raw_units.get(job.raw_ref).await {
            Ok(Some(raw)) => match self.pipeline.run(&raw).await {
                Ok(report) => report,
                Err(e) if e.is_store_error() => {
                    self.release(job).await;
                    return Err(e);
                }
                // Anything else would fail the same way on every retry.
                Err(e) => PipelineReport::new(
                    JobOutcome::failed(Stage::Persistence, e.to_string(), RetryMode::Backoff),
                    JobDiagnostics::default(),
                ),
            },
            Ok(None) => PipelineReport::new(
                JobOutcome::failed(
                    Stage::Load,
                    format!("raw unit {} not found", job.raw_ref),
                    RetryMode::Never,
                ),
                JobDiagnostics::default(),
            ),
            Err(e) if e.is_store_error() => {
                self.release(job).await;
                return Err(e);
            }
            Err(e) => PipelineReport::new(
                JobOutcome::failed(Stage::Load, e.to_string(), RetryMode::Backoff),
                JobDiagnostics::default(),
            ),
        };

        let held = self
            .queue
            .complete(
                job.id,
                &self.config.worker_id,
                &report.outcome,
                &report.diagnostics,
            )
            .await?;
        if !held {
            tracing::warn!(job_id = %job.id, "Claim lost before completion, outcome discarded");
            return Ok(());
        }

        if report
            .outcome
            .will_retry(job.attempt_count, job.max_attempts)
        {
            reporter.report(WorkerEvent::JobRequeued {
                job_id: job.id,
                error: report.outcome.error_message().unwrap_or_default(),
            });
            return Ok(());
        }

        let status = report.outcome.status();
        reporter.report(WorkerEvent::JobFinished {
            job_id: job.id,
            status,
        });
        if status == JobStatus::Failed {
            triage.surface(TriageReport {
                job_id: job.id,
                raw_ref: job.raw_ref,
                attempt_count: job.attempt_count,
                stage: report.diagnostics.stage,
                error: report.diagnostics.error,
                raw_snippet: report.diagnostics.raw_snippet,
            });
        }
        Ok(())
    }

    async fn release(&self, job: &ExtractionJob) {
        if let Err(e) = self.queue.release_job(job.id).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to release job");
        }
    }
}
