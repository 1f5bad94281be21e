pub mod circuit_breaker;
pub mod dedup;
pub mod enrich;
pub mod error;
pub mod extract;
pub mod job;
pub mod job_queue;
pub mod merge;
pub mod models;
pub mod pipeline;
pub mod prefilter;
pub mod scoring;
pub mod traits;
pub mod validation;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
pub use dedup::{DedupOutcome, DuplicateDetector};
pub use error::AppError;
pub use extract::{ExtractionExample, load_examples};
pub use job::{
    EnqueueResult, ExtractionJob, JobDiagnostics, JobOutcome, JobStatus, RetryConfig, Stage,
    WorkerConfig,
};
pub use job_queue::JobQueue;
pub use models::{
    CanonicalRecord, DuplicateGroup, GroupStatus, NewRawUnit, RawUnit, RecordDraft, RecordStatus,
    compute_hash,
};
pub use pipeline::{ExtractionPipeline, PipelineConfig, PipelineReport};
pub use scoring::DedupConfig;
pub use traits::{
    Extractor, GroupCreation, GroupMember, GroupStore, RawUnitStore, RecordStore, UpsertOutcome,
};
pub use validation::ValidationMode;
pub use worker::{
    TracingTriageSink, TracingWorkerReporter, TriageReport, TriageSink, WorkerEvent,
    WorkerReporter, WorkerService,
};
