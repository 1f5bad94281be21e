//! Test utilities: in-memory stores and mocks for the core traits.
//!
//! All doubles use `Arc<Mutex<_>>` so clones share state and tests can
//! assert on what was recorded.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::extract::ExtractionExample;
use crate::job::{
    EnqueueResult, ExtractionJob, JobDiagnostics, JobOutcome, JobStatus, RetryConfig,
    resolve_completion,
};
use crate::job_queue::JobQueue;
use crate::merge::{merge_record, new_record};
use crate::models::{
    CanonicalRecord, DuplicateGroup, GroupStatus, NewRawUnit, RawUnit, RecordDraft,
};
use crate::traits::{
    Extractor, GroupCreation, GroupMember, GroupStore, RawUnitStore, RecordStore, UpsertOutcome,
};
use crate::worker::{TriageReport, TriageSink, WorkerEvent, WorkerReporter};

type Slot = Arc<Mutex<Option<AppError>>>;

fn take_failure(slot: &Slot) -> Result<(), AppError> {
    match slot.lock().unwrap().take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn stale_cutoff(stale_after: Duration) -> DateTime<Utc> {
    Utc::now() - TimeDelta::from_std(stale_after).unwrap_or(TimeDelta::zero())
}

/// A stored raw unit with the given text, captured now.
pub fn raw_unit(source: &str, native: &str, text: &str) -> RawUnit {
    let unit = NewRawUnit {
        source_id: source.to_string(),
        native_id: native.to_string(),
        text: text.to_string(),
        captured_at: Utc::now(),
        edited_at: None,
        deleted: false,
        forwarded: false,
        link: Some(format!("https://t.me/{source}/{native}")),
    };
    RawUnit {
        id: Uuid::new_v4(),
        content_hash: unit.content_hash(),
        source_id: unit.source_id,
        native_id: unit.native_id,
        text: unit.text,
        captured_at: unit.captured_at,
        edited_at: None,
        deleted: false,
        forwarded: false,
        link: unit.link,
    }
}

/// A well-formed extraction response.
pub fn assignment_json(code: Option<&str>) -> serde_json::Value {
    serde_json::json!({
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
    })
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Mock extraction service. Each call pops the next canned response; once
/// the queue is empty the fallback is returned.
#[derive(Clone)]
pub struct MockExtractor {
    responses: Arc<Mutex<VecDeque<Result<serde_json::Value, AppError>>>>,
    fallback: Option<serde_json::Value>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockExtractor {
    /// Always answers with `data`.
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Some(data),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<serde_json::Value, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            fallback: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Texts the extractor was called with, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Extractor for MockExtractor {
    async fn request(
        &self,
        raw_text: &str,
        _prompt: &str,
        _examples: &[ExtractionExample],
        _model: &str,
    ) -> Result<serde_json::Value, AppError> {
        self.calls.lock().unwrap().push(raw_text.to_string());
        if let Some(next) = self.responses.lock().unwrap().pop_front() {
            return next;
        }
        self.fallback.clone().ok_or_else(|| AppError::LlmError {
            message: "no canned response left".into(),
            status_code: 200,
            retryable: false,
        })
    }
}

// ---------------------------------------------------------------------------
// InMemoryJobQueue
// ---------------------------------------------------------------------------

/// Job queue backed by a Vec. Every operation holds the lock for its whole
/// duration, so claims are exclusive across concurrent callers.
#[derive(Clone)]
pub struct InMemoryJobQueue {
    jobs: Arc<Mutex<Vec<ExtractionJob>>>,
    retry: RetryConfig,
    /// Number of upcoming `claim` calls that fail with a store error.
    claim_failures: Arc<Mutex<u32>>,
}

impl InMemoryJobQueue {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(Vec::new())),
            retry,
            claim_failures: Arc::new(Mutex::new(0)),
        }
    }

    pub fn fail_claims(&self, times: u32) {
        *self.claim_failures.lock().unwrap() = times;
    }

    /// Overwrite a stored job, e.g. to age a claim in a test.
    pub fn update(&self, job_id: Uuid, f: impl FnOnce(&mut ExtractionJob)) {
        if let Some(job) = self.jobs.lock().unwrap().iter_mut().find(|j| j.id == job_id) {
            f(job);
        }
    }
}

impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        raw_ref: Uuid,
        pipeline_version: &str,
    ) -> Result<EnqueueResult, AppError> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(existing) = jobs.iter().find(|j| {
            j.raw_ref == raw_ref
                && j.pipeline_version == pipeline_version
                && !j.status.is_terminal()
        }) {
            return Ok(EnqueueResult::Duplicate(existing.id));
        }
        let now = Utc::now();
        let job = ExtractionJob {
            id: Uuid::new_v4(),
            raw_ref,
            pipeline_version: pipeline_version.to_string(),
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts: self.retry.max_attempts,
            claimed_at: None,
            available_at: now,
            last_error: None,
            meta: serde_json::json!({}),
            worker_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        let id = job.id;
        jobs.push(job);
        Ok(EnqueueResult::Created(id))
    }

    async fn claim(
        &self,
        worker_id: &str,
        batch_size: usize,
        stale_after: Duration,
    ) -> Result<Vec<ExtractionJob>, AppError> {
        {
            let mut remaining = self.claim_failures.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AppError::StoreError("connection refused".into()));
            }
        }

        let now = Utc::now();
        let cutoff = stale_cutoff(stale_after);
        let mut jobs = self.jobs.lock().unwrap();
        let mut eligible: Vec<usize> = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| match j.status {
                JobStatus::Pending => j.available_at <= now,
                JobStatus::Processing => {
                    j.claimed_at.is_some_and(|at| at < cutoff) && j.attempt_count < j.max_attempts
                }
                _ => false,
            })
            .map(|(i, _)| i)
            .collect();
        eligible.sort_by_key(|&i| (jobs[i].available_at, jobs[i].created_at));

        Ok(eligible
            .into_iter()
            .take(batch_size)
            .map(|i| {
                let job = &mut jobs[i];
                job.status = JobStatus::Processing;
                job.claimed_at = Some(now);
                job.worker_id = Some(worker_id.to_string());
                job.attempt_count += 1;
                job.updated_at = now;
                job.clone()
            })
            .collect())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: &JobOutcome,
        diagnostics: &JobDiagnostics,
    ) -> Result<bool, AppError> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.iter_mut().find(|j| {
            j.id == job_id
                && j.status == JobStatus::Processing
                && j.worker_id.as_deref() == Some(worker_id)
        }) else {
            return Ok(false);
        };

        let completion =
            resolve_completion(job.attempt_count, job.max_attempts, outcome, &self.retry, now);
        job.status = completion.status;
        job.attempt_count = completion.attempt_count;
        job.last_error = completion.last_error;
        job.meta = diagnostics.to_value();
        job.updated_at = now;
        if let Some(at) = completion.available_at {
            job.available_at = at;
        }
        if job.status.is_terminal() {
            job.completed_at = Some(now);
        } else {
            job.worker_id = None;
            job.claimed_at = None;
        }
        Ok(true)
    }

    async fn reclaim_stale(&self, stale_after: Duration) -> Result<u64, AppError> {
        let now = Utc::now();
        let cutoff = stale_cutoff(stale_after);
        let mut count = 0;
        for job in self.jobs.lock().unwrap().iter_mut().filter(|j| {
            j.status == JobStatus::Processing && j.claimed_at.is_some_and(|at| at < cutoff)
        }) {
            job.attempt_count += 1;
            job.status = if job.attempt_count >= job.max_attempts {
                job.completed_at = Some(now);
                JobStatus::Failed
            } else {
                JobStatus::Pending
            };
            job.last_error = Some("stale claim".into());
            job.worker_id = None;
            job.claimed_at = None;
            job.available_at = now;
            job.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn release_job(&self, job_id: Uuid) -> Result<(), AppError> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::Processing)
        {
            release(job);
        }
        Ok(())
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let mut count = 0;
        for job in self.jobs.lock().unwrap().iter_mut().filter(|j| {
            j.status == JobStatus::Processing && j.worker_id.as_deref() == Some(worker_id)
        }) {
            release(job);
            count += 1;
        }
        Ok(count)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ExtractionJob>, AppError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == job_id)
            .cloned())
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<ExtractionJob>, AppError> {
        let mut jobs: Vec<_> = self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64, AppError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.status == status)
            .count() as i64)
    }
}

fn release(job: &mut ExtractionJob) {
    job.status = JobStatus::Pending;
    job.attempt_count = job.attempt_count.saturating_sub(1);
    job.worker_id = None;
    job.claimed_at = None;
    job.updated_at = Utc::now();
}

// ---------------------------------------------------------------------------
// InMemoryRawUnitStore
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct InMemoryRawUnitStore {
    units: Arc<Mutex<HashMap<(String, String), RawUnit>>>,
}

impl InMemoryRawUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a unit directly and return it.
    pub fn insert(&self, unit: RawUnit) -> RawUnit {
        self.units.lock().unwrap().insert(
            (unit.source_id.clone(), unit.native_id.clone()),
            unit.clone(),
        );
        unit
    }
}

impl RawUnitStore for InMemoryRawUnitStore {
    async fn upsert(&self, unit: &NewRawUnit) -> Result<(RawUnit, bool), AppError> {
        let mut units = self.units.lock().unwrap();
        let key = (unit.source_id.clone(), unit.native_id.clone());
        let hash = unit.content_hash();

        if let Some(stored) = units.get_mut(&key) {
            let changed = stored.content_hash != hash
                || stored.edited_at != unit.edited_at
                || stored.link != unit.link;
            if changed {
                stored.text = unit.text.clone();
                stored.edited_at = unit.edited_at;
                stored.deleted = unit.deleted;
                stored.forwarded = unit.forwarded;
                stored.link = unit.link.clone();
                stored.content_hash = hash;
            }
            return Ok((stored.clone(), changed));
        }

        let stored = RawUnit {
            id: Uuid::new_v4(),
            source_id: unit.source_id.clone(),
            native_id: unit.native_id.clone(),
            text: unit.text.clone(),
            captured_at: unit.captured_at,
            edited_at: unit.edited_at,
            deleted: unit.deleted,
            forwarded: unit.forwarded,
            link: unit.link.clone(),
            content_hash: hash,
        };
        units.insert(key, stored.clone());
        Ok((stored, true))
    }

    async fn get(&self, id: Uuid) -> Result<Option<RawUnit>, AppError> {
        Ok(self
            .units
            .lock()
            .unwrap()
            .values()
            .find(|u| u.id == id)
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// InMemoryRecordStore
// ---------------------------------------------------------------------------

type Records = Arc<Mutex<HashMap<Uuid, CanonicalRecord>>>;

/// Record store whose upsert runs the merge under the map lock.
#[derive(Clone)]
pub struct InMemoryRecordStore {
    records: Records,
    failure: Slot,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Store a record as-is (replacing one with the same id).
    pub fn insert(&self, record: CanonicalRecord) -> CanonicalRecord {
        self.records
            .lock()
            .unwrap()
            .insert(record.id, record.clone());
        record
    }

    pub fn all(&self) -> Vec<CanonicalRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    pub fn fail_next(&self, error: AppError) {
        *self.failure.lock().unwrap() = Some(error);
    }
}

impl RecordStore for InMemoryRecordStore {
    async fn upsert(&self, draft: &RecordDraft) -> Result<UpsertOutcome, AppError> {
        take_failure(&self.failure)?;
        let now = Utc::now();
        let mut records = self.records.lock().unwrap();
        let existing = records
            .values()
            .find(|r| r.record_key == draft.record_key)
            .cloned();

        let outcome = match existing {
            Some(existing) => UpsertOutcome {
                record: merge_record(&existing, draft, now),
                created: false,
                previous_status: Some(existing.status),
            },
            None => UpsertOutcome {
                record: new_record(draft, now),
                created: true,
                previous_status: None,
            },
        };
        records.insert(outcome.record.id, outcome.record.clone());
        Ok(outcome)
    }

    async fn get(&self, id: Uuid) -> Result<Option<CanonicalRecord>, AppError> {
        take_failure(&self.failure)?;
        Ok(self.records.lock().unwrap().get(&id).cloned())
    }

    async fn find_by_key(&self, record_key: &str) -> Result<Option<CanonicalRecord>, AppError> {
        take_failure(&self.failure)?;
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .find(|r| r.record_key == record_key)
            .cloned())
    }

    async fn find_by_pointer(
        &self,
        source_id: &str,
        native_id: &str,
    ) -> Result<Option<CanonicalRecord>, AppError> {
        take_failure(&self.failure)?;
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .find(|r| r.source_id == source_id && r.native_id.as_deref() == Some(native_id))
            .cloned())
    }

    async fn recent_candidates(
        &self,
        exclude_source: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CanonicalRecord>, AppError> {
        take_failure(&self.failure)?;
        let mut found: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| {
                r.status.is_open() && r.source_id != exclude_source && r.last_observed >= since
            })
            .cloned()
            .collect();
        found.sort_by(|a, b| b.last_observed.cmp(&a.last_observed));
        found.truncate(limit);
        Ok(found)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<CanonicalRecord>, AppError> {
        take_failure(&self.failure)?;
        let mut all = self.all();
        all.sort_by(|a, b| b.last_observed.cmp(&a.last_observed));
        all.truncate(limit);
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// InMemoryGroupStore
// ---------------------------------------------------------------------------

/// Group store sharing the record map of an [`InMemoryRecordStore`], so
/// membership flags are visible through the record store.
#[derive(Clone)]
pub struct InMemoryGroupStore {
    records: Records,
    groups: Arc<Mutex<HashMap<Uuid, DuplicateGroup>>>,
    failure: Slot,
}

impl InMemoryGroupStore {
    pub fn new(records: &InMemoryRecordStore) -> Self {
        Self {
            records: records.records.clone(),
            groups: Arc::new(Mutex::new(HashMap::new())),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    pub fn all_groups(&self) -> Vec<DuplicateGroup> {
        self.groups.lock().unwrap().values().cloned().collect()
    }

    pub fn fail_next(&self, error: AppError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    /// Recompute count and average confidence from the member rows.
    fn refresh(&self, group: &mut DuplicateGroup) {
        let records = self.records.lock().unwrap();
        let scores: Vec<f32> = records
            .values()
            .filter(|r| r.duplicate_group_id == Some(group.id))
            .filter_map(|r| r.duplicate_confidence_score)
            .collect();
        group.member_count = records
            .values()
            .filter(|r| r.duplicate_group_id == Some(group.id))
            .count() as u32;
        group.avg_confidence = if scores.is_empty() {
            0.0
        } else {
            scores.iter().sum::<f32>() / scores.len() as f32
        };
        group.updated_at = Utc::now();
    }

    fn stored(&self, group_id: Uuid) -> Result<DuplicateGroup, AppError> {
        self.groups
            .lock()
            .unwrap()
            .get(&group_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("group {group_id}")))
    }

    fn save(&self, group: &DuplicateGroup) {
        self.groups
            .lock()
            .unwrap()
            .insert(group.id, group.clone());
    }
}

impl GroupStore for InMemoryGroupStore {
    async fn create_group(
        &self,
        primary_record_id: Uuid,
        members: &[GroupMember],
    ) -> Result<GroupCreation, AppError> {
        take_failure(&self.failure)?;
        let now = Utc::now();
        let mut group = DuplicateGroup {
            id: Uuid::new_v4(),
            primary_record_id,
            member_count: 0,
            avg_confidence: 0.0,
            status: GroupStatus::Active,
            created_at: now,
            updated_at: now,
        };
        let mut previous = Vec::new();
        {
            let mut records = self.records.lock().unwrap();
            let groups = self.groups.lock().unwrap();
            let existing = members.iter().find_map(|m| {
                records
                    .get(&m.record_id)
                    .and_then(|r| r.duplicate_group_id)
                    .filter(|id| groups.get(id).is_some_and(|g| g.status == GroupStatus::Active))
            });
            if let Some(group_id) = existing {
                return Ok(GroupCreation::AlreadyGrouped(group_id));
            }
            drop(groups);

            for member in members {
                if let Some(record) = records.get_mut(&member.record_id) {
                    previous.extend(record.duplicate_group_id);
                    record.duplicate_group_id = Some(group.id);
                    record.is_primary_in_group = member.record_id == primary_record_id;
                    record.duplicate_confidence_score = Some(member.score);
                }
            }
        }
        for group_id in previous {
            if let Ok(mut old) = self.stored(group_id) {
                self.refresh(&mut old);
                self.save(&old);
            }
        }
        self.refresh(&mut group);
        self.save(&group);
        Ok(GroupCreation::Created(group))
    }

    async fn add_member(
        &self,
        group_id: Uuid,
        member: GroupMember,
    ) -> Result<DuplicateGroup, AppError> {
        take_failure(&self.failure)?;
        let mut group = self.stored(group_id)?;
        if let Some(record) = self.records.lock().unwrap().get_mut(&member.record_id) {
            record.duplicate_group_id = Some(group_id);
            record.is_primary_in_group = false;
            record.duplicate_confidence_score = Some(member.score);
        }
        self.refresh(&mut group);
        self.save(&group);
        Ok(group)
    }

    async fn set_primary(
        &self,
        group_id: Uuid,
        record_id: Uuid,
    ) -> Result<DuplicateGroup, AppError> {
        take_failure(&self.failure)?;
        let mut group = self.stored(group_id)?;
        for record in self
            .records
            .lock()
            .unwrap()
            .values_mut()
            .filter(|r| r.duplicate_group_id == Some(group_id))
        {
            record.is_primary_in_group = record.id == record_id;
        }
        group.primary_record_id = record_id;
        group.updated_at = Utc::now();
        self.save(&group);
        Ok(group)
    }

    async fn set_status(&self, group_id: Uuid, status: GroupStatus) -> Result<(), AppError> {
        take_failure(&self.failure)?;
        let mut group = self.stored(group_id)?;
        group.status = status;
        group.updated_at = Utc::now();
        self.save(&group);
        Ok(())
    }

    async fn get_group(&self, group_id: Uuid) -> Result<Option<DuplicateGroup>, AppError> {
        take_failure(&self.failure)?;
        Ok(self.groups.lock().unwrap().get(&group_id).cloned())
    }

    async fn list_members(&self, group_id: Uuid) -> Result<Vec<CanonicalRecord>, AppError> {
        take_failure(&self.failure)?;
        let mut members: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.duplicate_group_id == Some(group_id))
            .cloned()
            .collect();
        members.sort_by_key(|r| r.first_observed);
        Ok(members)
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

/// Collects worker events for assertions.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    pub events: Arc<Mutex<Vec<WorkerEvent>>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<WorkerEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl WorkerReporter for RecordingReporter {
    fn report(&self, event: WorkerEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Collects triage reports for assertions.
#[derive(Clone, Default)]
pub struct RecordingTriageSink {
    pub reports: Arc<Mutex<Vec<TriageReport>>>,
}

impl RecordingTriageSink {
    pub fn reports(&self) -> Vec<TriageReport> {
        self.reports.lock().unwrap().clone()
    }
}

impl TriageSink for RecordingTriageSink {
    fn surface(&self, report: TriageReport) {
        self.reports.lock().unwrap().push(report);
    }
}
