use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of an extraction job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Ok,
    Failed,
    Filtered,
    Invalid,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Ok => "ok",
            JobStatus::Failed => "failed",
            JobStatus::Filtered => "filtered",
            JobStatus::Invalid => "invalid",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "ok" => Ok(JobStatus::Ok),
            "failed" => Ok(JobStatus::Failed),
            "filtered" => Ok(JobStatus::Filtered),
            "invalid" => Ok(JobStatus::Invalid),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Pipeline stage a diagnostic refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Load,
    Prefilter,
    Extraction,
    Enrichment,
    Validation,
    Persistence,
    Dedup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Load => "load",
            Stage::Prefilter => "prefilter",
            Stage::Extraction => "extraction",
            Stage::Enrichment => "enrichment",
            Stage::Validation => "validation",
            Stage::Persistence => "persistence",
            Stage::Dedup => "dedup",
        }
    }
}

/// Capped exponential backoff for failed jobs.
///
/// Delay for attempt `n` (1-indexed) is `min(base_delay * 2^(n-1), max_delay)`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: TimeDelta,
    pub max_delay: TimeDelta,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: TimeDelta::seconds(30),
            max_delay: TimeDelta::minutes(30),
        }
    }
}

impl RetryConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> TimeDelta {
        let exponent = attempt.saturating_sub(1).min(30);
        let factor = 1i32 << exponent;
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        std::cmp::min(delay, self.max_delay)
    }
}

/// A row in the extraction job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub id: Uuid,
    pub raw_ref: Uuid,
    pub pipeline_version: String,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub claimed_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub meta: serde_json::Value,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExtractionJob {
    pub fn can_retry(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// A new job row was created.
    Created(Uuid),
    /// A non-terminal job for the same key already exists.
    Duplicate(Uuid),
}

impl EnqueueResult {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => *id,
        }
    }

    pub fn enqueued(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// How a failed job is rescheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Charge the attempt and wait out the exponential backoff.
    Backoff,
    /// Dependency unavailable: refund the attempt and retry after the delay.
    Deferred(Duration),
    /// Retrying cannot help; fail terminally now.
    Never,
}

/// What the pipeline decided for one job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Ok,
    Filtered { reason: String },
    Invalid { errors: Vec<String> },
    Failed {
        stage: Stage,
        error: String,
        retry: RetryMode,
    },
}

impl JobOutcome {
    pub fn failed(stage: Stage, error: impl Into<String>, retry: RetryMode) -> Self {
        JobOutcome::Failed {
            stage,
            error: error.into(),
            retry,
        }
    }

    /// Whether a job at `attempt_count` of `max_attempts` goes back to the queue.
    pub fn will_retry(&self, attempt_count: u32, max_attempts: u32) -> bool {
        match self {
            JobOutcome::Failed {
                retry: RetryMode::Deferred(_),
                ..
            } => true,
            JobOutcome::Failed {
                retry: RetryMode::Backoff,
                ..
            } => attempt_count < max_attempts,
            _ => false,
        }
    }

    /// Status the outcome maps to before retry handling.
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Ok => JobStatus::Ok,
            JobOutcome::Filtered { .. } => JobStatus::Filtered,
            JobOutcome::Invalid { .. } => JobStatus::Invalid,
            JobOutcome::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            JobOutcome::Ok => None,
            JobOutcome::Filtered { reason } => Some(format!("filtered: {reason}")),
            JobOutcome::Invalid { errors } => Some(errors.join("; ")),
            JobOutcome::Failed { error, .. } => Some(error.clone()),
        }
    }
}

/// Row changes `complete()` must apply.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: JobStatus,
    pub attempt_count: u32,
    pub available_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Completion {
    pub fn is_requeue(&self) -> bool {
        self.status == JobStatus::Pending
    }
}

/// Decide the next row state for a job finishing with `outcome`.
pub fn resolve_completion(
    attempt_count: u32,
    max_attempts: u32,
    outcome: &JobOutcome,
    retry: &RetryConfig,
    now: DateTime<Utc>,
) -> Completion {
    let last_error = outcome.error_message();
    match outcome {
        JobOutcome::Failed {
            retry: RetryMode::Deferred(after),
            ..
        } => Completion {
            status: JobStatus::Pending,
            attempt_count: attempt_count.saturating_sub(1),
            available_at: Some(now + TimeDelta::from_std(*after).unwrap_or(retry.base_delay)),
            last_error,
        },
        JobOutcome::Failed {
            retry: RetryMode::Backoff,
            ..
        } if attempt_count < max_attempts => Completion {
            status: JobStatus::Pending,
            attempt_count,
            available_at: Some(now + retry.delay_for_attempt(attempt_count)),
            last_error,
        },
        _ => Completion {
            status: outcome.status(),
            attempt_count,
            available_at: None,
            last_error,
        },
    }
}

/// Structured diagnostics stored alongside a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobDiagnostics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_snippet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_quality: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub record_ids: Vec<Uuid>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub validation_warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub discarded_identifiers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub segments: Vec<SegmentDiagnostics>,
}

/// Per-segment result when a bundled unit was split.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SegmentDiagnostics {
    pub identifier: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl JobDiagnostics {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub pipeline_version: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Jobs from one batch processed at the same time.
    pub concurrency: usize,
    /// A `processing` job older than this is considered abandoned.
    pub stale_after: Duration,
    pub reclaim_interval: Duration,
    /// Upper bound for the worker-level backoff on store failures.
    pub max_store_backoff: Duration,
    pub retry_config: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            pipeline_version: "v1".to_string(),
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            concurrency: 4,
            stale_after: Duration::from_secs(600),
            reclaim_interval: Duration::from_secs(60),
            max_store_backoff: Duration::from_secs(300),
            retry_config: RetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_pipeline_version(mut self, version: impl Into<String>) -> Self {
        self.pipeline_version = version.into();
        self
    }

    /// Worker-level backoff after `failures` consecutive store errors.
    pub fn store_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self.poll_interval.saturating_mul(1u32 << exponent);
        std::cmp::min(delay, self.max_store_backoff)
    }
}
