use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sift_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use sift_core::error::AppError;
use sift_core::extract::ExtractionExample;
use sift_core::job::{JobStatus, WorkerConfig};
use sift_core::job_queue::JobQueue;
use sift_core::pipeline::{ExtractionPipeline, PipelineConfig};
use sift_core::scoring::DedupConfig;
use sift_core::traits::{Extractor, RawUnitStore, RecordStore};
use sift_core::worker::{TracingTriageSink, TracingWorkerReporter, WorkerService};
use sift_db::{ExtractionJobRepository, GroupRepository, RawUnitRepository, RecordRepository};
use sqlx::PgPool;

use crate::integration::common::{new_unit, setup_test_db};

/// Answers every request with the same assignment, or the same error.
#[derive(Clone)]
struct CannedExtractor {
    response: Result<serde_json::Value, u16>,
    calls: Arc<AtomicUsize>,
}

impl CannedExtractor {
    fn assignment(code: &str) -> Self {
        Self {
            response: Ok(serde_json::json!({
                "assignment_code": code,
                "title": "Sec 3 Math tuition",
                "description": null,
                "location": "Bedok",
                "postal_code": null,
                "rate": null,
                "schedule": null,
                "subjects": ["Math"],
                "levels": ["Secondary"],
                "status": "open"
            })),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn failing(status_code: u16) -> Self {
        Self {
            response: Err(status_code),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Extractor for CannedExtractor {
    async fn request(
        &self,
        _raw_text: &str,
        _prompt: &str,
        _examples: &[ExtractionExample],
        _model: &str,
    ) -> Result<serde_json::Value, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.response {
            Ok(value) => Ok(value.clone()),
            Err(status_code) => Err(AppError::LlmError {
                message: "upstream unavailable".into(),
                status_code: *status_code,
                retryable: *status_code >= 500,
            }),
        }
    }
}

type PgWorker = WorkerService<
    ExtractionJobRepository,
    RawUnitRepository,
    CannedExtractor,
    RecordRepository,
    GroupRepository,
>;

fn worker(pool: &PgPool, extractor: CannedExtractor) -> PgWorker {
    let config = WorkerConfig::default()
        .with_worker_id("worker-it")
        .with_batch_size(10)
        .with_concurrency(2);
    let pipeline = ExtractionPipeline::new(
        extractor,
        RecordRepository::new(pool.clone()),
        GroupRepository::new(pool.clone()),
        CircuitBreaker::new("extraction", CircuitBreakerConfig::default()),
        PipelineConfig::default(),
        DedupConfig::default(),
    );
    WorkerService::new(
        ExtractionJobRepository::new(pool.clone()).with_retry_config(config.retry_config.clone()),
        RawUnitRepository::new(pool.clone()),
        pipeline,
        config,
    )
}

async fn ingest(pool: &PgPool, source: &str, native: &str, text: &str) {
    let (unit, changed) = RawUnitRepository::new(pool.clone())
        .upsert(&new_unit(source, native, text))
        .await
        .unwrap();
    assert!(changed);
    ExtractionJobRepository::new(pool.clone())
        .enqueue(unit.id, "v1")
        .await
        .unwrap();
}

#[tokio::test]
async fn worker_extracts_and_groups_cross_source_posts() {
    let (pool, _container) = setup_test_db().await;
    let extractor = CannedExtractor::assignment("D2388");
    let calls = extractor.calls.clone();
    let worker = worker(&pool, extractor);

    let text = "D2388 Math tutor needed at 123456";
    ingest(&pool, "tutors_sg", "1", text).await;
    let claimed = worker
        .run_once(&TracingWorkerReporter, &TracingTriageSink)
        .await
        .unwrap();
    assert_eq!(claimed, 1);

    ingest(&pool, "home_tuition", "2", text).await;
    worker
        .run_once(&TracingWorkerReporter, &TracingTriageSink)
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let jobs = ExtractionJobRepository::new(pool.clone());
    assert_eq!(jobs.count_by_status(JobStatus::Ok).await.unwrap(), 2);

    let records = RecordRepository::new(pool.clone());
    let first = records
        .find_by_key("tutors_sg:code:D2388")
        .await
        .unwrap()
        .unwrap();
    let second = records
        .find_by_key("home_tuition:code:D2388")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.signals.postal_code.as_deref(), Some("123456"));
    let group_id = first.duplicate_group_id.expect("first record grouped");
    assert_eq!(second.duplicate_group_id, Some(group_id));

    let done = jobs.list_jobs(Some(JobStatus::Ok), 10).await.unwrap();
    assert!(done.iter().all(|j| !j.meta["record_ids"].as_array().unwrap().is_empty()));
}

#[tokio::test]
async fn worker_filters_noise_without_calling_extractor() {
    let (pool, _container) = setup_test_db().await;
    let extractor = CannedExtractor::assignment("D2388");
    let calls = extractor.calls.clone();
    let worker = worker(&pool, extractor);

    ingest(&pool, "tutors_sg", "1", "Good morning!").await;
    worker
        .run_once(&TracingWorkerReporter, &TracingTriageSink)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let jobs = ExtractionJobRepository::new(pool.clone());
    assert_eq!(jobs.count_by_status(JobStatus::Filtered).await.unwrap(), 1);
}

#[tokio::test]
async fn worker_requeues_transient_extraction_failures() {
    let (pool, _container) = setup_test_db().await;
    let worker = worker(&pool, CannedExtractor::failing(503));

    ingest(&pool, "tutors_sg", "1", "D2388 Math tutor needed at 123456").await;
    worker
        .run_once(&TracingWorkerReporter, &TracingTriageSink)
        .await
        .unwrap();

    let jobs = ExtractionJobRepository::new(pool.clone());
    let job = jobs.list_jobs(None, 1).await.unwrap().remove(0);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 1);
    assert!(job.available_at > chrono::Utc::now());
    assert_eq!(job.meta["stage"], "extraction");

    // Backoff keeps it out of the next poll
    let claimed = worker
        .run_once(&TracingWorkerReporter, &TracingTriageSink)
        .await
        .unwrap();
    assert_eq!(claimed, 0);
}
