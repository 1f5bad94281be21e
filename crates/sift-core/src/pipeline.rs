use std::time::Duration;

use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::dedup::DuplicateDetector;
use crate::enrich;
use crate::error::AppError;
use crate::extract::{self, DEFAULT_PROMPT, ExtractionExample};
use crate::job::{JobDiagnostics, JobOutcome, RetryMode, SegmentDiagnostics, Stage};
use crate::models::{RawUnit, RecordDraft, StatusSignal, record_key};
use crate::prefilter::{self, BundlePlan, FilterOutcome};
use crate::scoring::DedupConfig;
use crate::traits::{Extractor, GroupStore, RecordStore, UpsertOutcome};
use crate::validation::{self, SchemaCheck, ValidationMode};

/// Job error recorded when the extraction breaker rejects a call.
pub const BREAKER_OPEN: &str = "breaker_open";

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_SNIPPET_CHARS: usize = 280;

/// Shortest requeue delay after a breaker rejection.
const MIN_BREAKER_RETRY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub validation_mode: ValidationMode,
    pub model: String,
    pub prompt: String,
    pub examples: Vec<ExtractionExample>,
    /// JSON Schema for the extraction response.
    pub response_schema: serde_json::Value,
    /// Characters of raw text kept in job diagnostics.
    pub snippet_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            validation_mode: ValidationMode::default(),
            model: DEFAULT_MODEL.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            examples: Vec::new(),
            response_schema: extract::response_schema(),
            snippet_chars: DEFAULT_SNIPPET_CHARS,
        }
    }
}

impl PipelineConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_examples(mut self, examples: Vec<ExtractionExample>) -> Self {
        self.examples = examples;
        self
    }

    pub fn with_validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }
}

/// Terminal decision for a job plus what to store alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub outcome: JobOutcome,
    pub diagnostics: JobDiagnostics,
}

impl PipelineReport {
    /// Fill in the stage and error diagnostics implied by `outcome`.
    pub fn new(outcome: JobOutcome, mut diagnostics: JobDiagnostics) -> Self {
        if diagnostics.stage.is_none() {
            diagnostics.stage = match &outcome {
                JobOutcome::Ok => None,
                JobOutcome::Filtered { .. } => Some(Stage::Prefilter),
                JobOutcome::Invalid { .. } => Some(Stage::Validation),
                JobOutcome::Failed { stage, .. } => Some(*stage),
            };
        }
        diagnostics.error = outcome.error_message();
        Self {
            outcome,
            diagnostics,
        }
    }
}

/// Result of the post-prefilter stages for one unit or segment.
#[derive(Debug, Clone)]
struct UnitRun {
    outcome: JobOutcome,
    record_id: Option<Uuid>,
    parse_quality: Option<f32>,
    warnings: Vec<String>,
    discarded: Vec<String>,
}

impl UnitRun {
    fn from_outcome(outcome: JobOutcome) -> Self {
        Self {
            outcome,
            record_id: None,
            parse_quality: None,
            warnings: Vec::new(),
            discarded: Vec::new(),
        }
    }

    fn failed(stage: Stage, error: impl Into<String>, retry: RetryMode) -> Self {
        Self::from_outcome(JobOutcome::failed(stage, error, retry))
    }
}

/// Combined status of a split unit: any failure fails the job (so it is
/// retried), otherwise one persisted segment makes it `ok`.
fn aggregate(runs: &[&UnitRun]) -> JobOutcome {
    if let Some(failed) = runs
        .iter()
        .find(|r| matches!(r.outcome, JobOutcome::Failed { .. }))
    {
        return failed.outcome.clone();
    }
    if runs.iter().any(|r| r.outcome == JobOutcome::Ok) {
        return JobOutcome::Ok;
    }
    let errors: Vec<String> = runs
        .iter()
        .filter_map(|r| match &r.outcome {
            JobOutcome::Invalid { errors } => Some(errors.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    if !errors.is_empty() {
        return JobOutcome::Invalid { errors };
    }
    JobOutcome::Filtered {
        reason: "all segments filtered".to_string(),
    }
}

/// Classify an extraction failure for retry purposes.
fn extraction_retry(error: &AppError) -> RetryMode {
    if error.is_retryable() || error.should_trip_circuit() {
        RetryMode::Backoff
    } else if matches!(error, AppError::SerializationError(_)) {
        // Malformed model output may not repeat.
        RetryMode::Backoff
    } else {
        RetryMode::Never
    }
}

/// Orchestrates prefilter → guarded extraction → enrichment → validation →
/// persistence → duplicate detection for one raw unit.
///
/// Generic over the extraction boundary and the stores so every stage can
/// run against in-memory doubles.
pub struct ExtractionPipeline<E, R, G>
where
    E: Extractor,
    R: RecordStore,
    G: GroupStore,
{
    extractor: E,
    records: R,
    detector: DuplicateDetector<R, G>,
    breaker: CircuitBreaker,
    schema: SchemaCheck,
    config: PipelineConfig,
}

impl<E, R, G> ExtractionPipeline<E, R, G>
where
    E: Extractor,
    R: RecordStore,
    G: GroupStore,
{
    pub fn new(
        extractor: E,
        records: R,
        groups: G,
        breaker: CircuitBreaker,
        config: PipelineConfig,
        dedup: DedupConfig,
    ) -> Self {
        let detector = DuplicateDetector::new(records.clone(), groups, dedup);
        let schema = SchemaCheck::compile(&config.response_schema);
        Self {
            extractor,
            records,
            detector,
            breaker,
            schema,
            config,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn detector(&self) -> &DuplicateDetector<R, G> {
        &self.detector
    }

    /// Run every stage for `raw`.
    ///
    /// Only store-connectivity failures are returned as `Err`; everything
    /// else is folded into the report's outcome.
    pub async fn run(&self, raw: &RawUnit) -> Result<PipelineReport, AppError> {
        let mut diagnostics = JobDiagnostics {
            raw_snippet: Some(raw.snippet(self.config.snippet_chars)),
            ..Default::default()
        };

        if raw.deleted {
            return self.close_deleted(raw, diagnostics).await;
        }

        if let FilterOutcome::Filtered { reason } = prefilter::filter_unit(&raw.text, raw.forwarded)
        {
            tracing::debug!(raw_ref = %raw.id, %reason, "Unit filtered");
            return Ok(PipelineReport::new(
                JobOutcome::Filtered { reason },
                diagnostics,
            ));
        }

        if let Some((code, signal)) = prefilter::status_update(&raw.text)
            && let Some(outcome) = self
                .apply_status_update(raw, &code, signal, &mut diagnostics)
                .await?
        {
            return Ok(PipelineReport::new(outcome, diagnostics));
        }

        if let FilterOutcome::Filtered { reason } = prefilter::filter_non_entity(&raw.text) {
            tracing::debug!(raw_ref = %raw.id, %reason, "Unit filtered");
            return Ok(PipelineReport::new(
                JobOutcome::Filtered { reason },
                diagnostics,
            ));
        }

        let plan = prefilter::plan_bundle(&raw.text);
        diagnostics
            .discarded_identifiers
            .extend(plan.discarded().iter().cloned());

        let outcome = match plan {
            BundlePlan::Single { .. } => {
                let run = self.run_unit(raw, &raw.text, None).await?;
                diagnostics.parse_quality = run.parse_quality;
                self.absorb(&mut diagnostics, &run);
                run.outcome
            }
            BundlePlan::Split { segments, .. } => {
                tracing::info!(raw_ref = %raw.id, segments = segments.len(), "Splitting bundled unit");
                let mut runs = Vec::with_capacity(segments.len());
                for segment in &segments {
                    let run = self
                        .run_unit(raw, &segment.text, Some(&segment.identifier))
                        .await?;
                    self.absorb(&mut diagnostics, &run);
                    diagnostics.segments.push(SegmentDiagnostics {
                        identifier: segment.identifier.clone(),
                        status: run.outcome.status(),
                        detail: run.outcome.error_message(),
                    });
                    let stop = matches!(
                        &run.outcome,
                        JobOutcome::Failed {
                            retry: RetryMode::Deferred(_),
                            ..
                        }
                    );
                    runs.push(run);
                    if stop {
                        break;
                    }
                }
                aggregate(&runs.iter().collect::<Vec<_>>())
            }
        };

        Ok(PipelineReport::new(outcome, diagnostics))
    }

    fn absorb(&self, diagnostics: &mut JobDiagnostics, run: &UnitRun) {
        diagnostics.record_ids.extend(run.record_id);
        diagnostics
            .validation_warnings
            .extend(run.warnings.iter().cloned());
        diagnostics
            .discarded_identifiers
            .extend(run.discarded.iter().cloned());
    }

    /// Guarded extraction through persistence for one unit or segment.
    async fn run_unit(
        &self,
        raw: &RawUnit,
        text: &str,
        forced_key: Option<&str>,
    ) -> Result<UnitRun, AppError> {
        let response = match self
            .breaker
            .call(|| {
                self.extractor.request(
                    text,
                    &self.config.prompt,
                    &self.config.examples,
                    &self.config.model,
                )
            })
            .await
        {
            Ok(value) => value,
            Err(CircuitBreakerError::Open { name, retry_after }) => {
                tracing::warn!(raw_ref = %raw.id, circuit = %name, ?retry_after, "Extraction skipped, breaker open");
                return Ok(UnitRun::failed(
                    Stage::Extraction,
                    BREAKER_OPEN,
                    RetryMode::Deferred(retry_after.max(MIN_BREAKER_RETRY)),
                ));
            }
            Err(CircuitBreakerError::Inner(e)) => {
                tracing::warn!(raw_ref = %raw.id, error = %e, "Extraction failed");
                return Ok(UnitRun::failed(
                    Stage::Extraction,
                    e.to_string(),
                    extraction_retry(&e),
                ));
            }
        };

        let extracted = match extract::parse_response(&response, text, forced_key) {
            Ok(extracted) => extracted,
            Err(AppError::ValidationError(errors)) => {
                return Ok(UnitRun::from_outcome(JobOutcome::Invalid { errors }));
            }
            Err(e) => {
                return Ok(UnitRun::from_outcome(JobOutcome::Invalid {
                    errors: vec![e.to_string()],
                }));
            }
        };

        let parsed = enrich::enrich(text, extracted.parsed);
        let mut run = UnitRun {
            parse_quality: Some(parsed.parse_quality),
            discarded: extracted.discarded_identifiers,
            ..UnitRun::from_outcome(JobOutcome::Ok)
        };

        let report = match validation::validate(
            self.config.validation_mode,
            &self.schema,
            &response,
            &parsed,
            raw.link.as_deref(),
        ) {
            Ok(report) => report,
            Err(e) => {
                run.outcome = JobOutcome::failed(Stage::Validation, e.to_string(), RetryMode::Never);
                return Ok(run);
            }
        };
        run.warnings = report.warnings;
        if !report.errors.is_empty() {
            tracing::info!(raw_ref = %raw.id, errors = ?report.errors, "Extraction rejected by validation");
            run.outcome = JobOutcome::Invalid {
                errors: report.errors,
            };
            return Ok(run);
        }

        let draft = RecordDraft::from_parsed(raw, parsed);
        let upserted = match self.persist(&draft).await? {
            Ok(upserted) => upserted,
            Err(outcome) => {
                run.outcome = outcome;
                return Ok(run);
            }
        };
        run.record_id = Some(upserted.record.id);
        tracing::info!(
            raw_ref = %raw.id,
            record_id = %upserted.record.id,
            created = upserted.created,
            "Record persisted"
        );

        self.follow_up(&upserted, &mut run.warnings).await;
        Ok(run)
    }

    /// Upsert a draft. Store errors propagate; anything else becomes a
    /// persistence-stage failure.
    async fn persist(
        &self,
        draft: &RecordDraft,
    ) -> Result<Result<UpsertOutcome, JobOutcome>, AppError> {
        match self.records.upsert(draft).await {
            Ok(upserted) => Ok(Ok(upserted)),
            Err(e) if e.is_store_error() => Err(e),
            Err(e) => Ok(Err(JobOutcome::failed(
                Stage::Persistence,
                e.to_string(),
                RetryMode::Backoff,
            ))),
        }
    }

    /// Duplicate detection after a merge. Never fails the owning job.
    async fn follow_up(&self, upserted: &UpsertOutcome, warnings: &mut Vec<String>) {
        let record = &upserted.record;
        let result = if upserted.closed_now() {
            self.detector.on_record_closed(record).await.map(|_| ())
        } else if record.status.is_open() {
            self.detector.process(record).await.map(|_| ())
        } else {
            Ok(())
        };

        if let Err(e) = result {
            tracing::warn!(record_id = %record.id, error = %e, "Duplicate detection failed");
            warnings.push(format!("{}: {e}", Stage::Dedup.as_str()));
        }
    }

    /// Close the record a deleted unit points at.
    async fn close_deleted(
        &self,
        raw: &RawUnit,
        mut diagnostics: JobDiagnostics,
    ) -> Result<PipelineReport, AppError> {
        diagnostics.stage = Some(Stage::Prefilter);

        let mut target = self
            .records
            .find_by_pointer(&raw.source_id, &raw.native_id)
            .await?;
        if target.is_none() {
            let (verified, _) =
                prefilter::verify_all(&raw.text, &prefilter::candidate_identifiers(&raw.text));
            let key = match verified.as_slice() {
                [code] => record_key(&raw.source_id, Some(code), &raw.native_id),
                _ => record_key(&raw.source_id, None, &raw.native_id),
            };
            target = self.records.find_by_key(&key).await?;
        }

        let Some(record) = target else {
            tracing::info!(raw_ref = %raw.id, "Deleted unit has no record to close");
            return Ok(PipelineReport::new(JobOutcome::Ok, diagnostics));
        };

        let draft = RecordDraft::close_signal(raw, record.record_key.clone());
        let upserted = match self.persist(&draft).await? {
            Ok(upserted) => upserted,
            Err(outcome) => return Ok(PipelineReport::new(outcome, diagnostics)),
        };
        diagnostics.record_ids.push(upserted.record.id);
        tracing::info!(
            raw_ref = %raw.id,
            record_id = %upserted.record.id,
            status = %upserted.record.status,
            "Source deletion applied"
        );

        self.follow_up(&upserted, &mut diagnostics.validation_warnings)
            .await;
        Ok(PipelineReport::new(JobOutcome::Ok, diagnostics))
    }

    /// Apply a short "D2388 taken" style update to an existing record.
    ///
    /// Returns `None` when no record carries the code, leaving the unit to
    /// the non-entity filter.
    async fn apply_status_update(
        &self,
        raw: &RawUnit,
        code: &str,
        signal: StatusSignal,
        diagnostics: &mut JobDiagnostics,
    ) -> Result<Option<JobOutcome>, AppError> {
        let key = record_key(&raw.source_id, Some(code), &raw.native_id);
        let Some(record) = self.records.find_by_key(&key).await? else {
            return Ok(None);
        };

        diagnostics.stage = Some(Stage::Prefilter);
        let draft = RecordDraft::signal(raw, record.record_key, signal);
        let upserted = match self.persist(&draft).await? {
            Ok(upserted) => upserted,
            Err(outcome) => return Ok(Some(outcome)),
        };
        diagnostics.record_ids.push(upserted.record.id);
        tracing::info!(
            raw_ref = %raw.id,
            record_id = %upserted.record.id,
            ?signal,
            status = %upserted.record.status,
            "Status update applied"
        );

        self.follow_up(&upserted, &mut diagnostics.validation_warnings)
            .await;
        Ok(Some(JobOutcome::Ok))
    }
}
