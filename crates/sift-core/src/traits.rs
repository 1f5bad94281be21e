use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::extract::ExtractionExample;
use crate::models::{
    CanonicalRecord, DuplicateGroup, GroupStatus, NewRawUnit, RawUnit, RecordDraft, RecordStatus,
};

/// The guarded-extraction boundary: one structured-output request to an
/// external inference service. Always called through the circuit breaker.
pub trait Extractor: Send + Sync + Clone {
    fn request(
        &self,
        raw_text: &str,
        prompt: &str,
        examples: &[ExtractionExample],
        model: &str,
    ) -> impl Future<Output = Result<serde_json::Value, AppError>> + Send;
}

/// Storage for captured raw units.
pub trait RawUnitStore: Send + Sync + Clone {
    /// Insert or update on `(source_id, native_id)`.
    ///
    /// Returns the stored unit and whether anything changed.
    fn upsert(
        &self,
        unit: &NewRawUnit,
    ) -> impl Future<Output = Result<(RawUnit, bool), AppError>> + Send;

    fn get(&self, id: Uuid) -> impl Future<Output = Result<Option<RawUnit>, AppError>> + Send;
}

/// Result of a merge-upsert.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub record: CanonicalRecord,
    pub created: bool,
    /// Status before the merge; `None` when the record was created.
    pub previous_status: Option<RecordStatus>,
}

impl UpsertOutcome {
    /// True when this merge moved an open record out of `open`.
    pub fn closed_now(&self) -> bool {
        self.previous_status == Some(RecordStatus::Open) && !self.record.status.is_open()
    }
}

/// Storage for canonical records.
///
/// `upsert` must evaluate [`crate::merge::merge_record`] against the stored
/// row under a per-key lock or inside a transaction so concurrent merges
/// for the same `record_key` never lose updates.
pub trait RecordStore: Send + Sync + Clone {
    fn upsert(
        &self,
        draft: &RecordDraft,
    ) -> impl Future<Output = Result<UpsertOutcome, AppError>> + Send;

    fn get(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<CanonicalRecord>, AppError>> + Send;

    fn find_by_key(
        &self,
        record_key: &str,
    ) -> impl Future<Output = Result<Option<CanonicalRecord>, AppError>> + Send;

    /// The record whose pointer fields reference this native unit.
    fn find_by_pointer(
        &self,
        source_id: &str,
        native_id: &str,
    ) -> impl Future<Output = Result<Option<CanonicalRecord>, AppError>> + Send;

    /// Open records from sources other than `exclude_source` last observed
    /// at or after `since`, newest first.
    fn recent_candidates(
        &self,
        exclude_source: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<CanonicalRecord>, AppError>> + Send;

    fn list_recent(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<CanonicalRecord>, AppError>> + Send;
}

/// A record joining a group together with its match score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupMember {
    pub record_id: Uuid,
    pub score: f32,
}

/// Result of [`GroupStore::create_group`].
#[derive(Debug, Clone, PartialEq)]
pub enum GroupCreation {
    Created(DuplicateGroup),
    /// A member already belongs to this active group. Nothing was written.
    AlreadyGrouped(Uuid),
}

/// Storage for duplicate groups and record membership.
pub trait GroupStore: Send + Sync + Clone {
    /// Create an active group and mark every member (one of them primary).
    ///
    /// Members are checked and marked atomically. If one of them already
    /// belongs to an active group, the first such group in `members` order
    /// is returned as [`GroupCreation::AlreadyGrouped`] instead.
    fn create_group(
        &self,
        primary_record_id: Uuid,
        members: &[GroupMember],
    ) -> impl Future<Output = Result<GroupCreation, AppError>> + Send;

    /// Add a record to an existing group, refreshing count and average.
    fn add_member(
        &self,
        group_id: Uuid,
        member: GroupMember,
    ) -> impl Future<Output = Result<DuplicateGroup, AppError>> + Send;

    /// Move the primary flag to `record_id`.
    fn set_primary(
        &self,
        group_id: Uuid,
        record_id: Uuid,
    ) -> impl Future<Output = Result<DuplicateGroup, AppError>> + Send;

    fn set_status(
        &self,
        group_id: Uuid,
        status: GroupStatus,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_group(
        &self,
        group_id: Uuid,
    ) -> impl Future<Output = Result<Option<DuplicateGroup>, AppError>> + Send;

    fn list_members(
        &self,
        group_id: Uuid,
    ) -> impl Future<Output = Result<Vec<CanonicalRecord>, AppError>> + Send;
}
