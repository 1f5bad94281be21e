//! Conservative field-level merge of a new observation into a stored record.
//!
//! Each field carries a policy in [`MERGE_POLICY`]; [`merge_record`]
//! evaluates the table generically. The status field follows its own small
//! state machine ([`next_status`]).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    CanonicalRecord, GeoPoint, RateRange, RecordDraft, RecordStatus, StatusSignal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    /// Replace when the incoming source timestamp is at least as new as the stored pointer.
    ReplaceIfNewer,
    /// Replace when incoming parse quality is at least the stored quality, or the slot is empty.
    ReplaceIfBetterQuality,
    /// Set union, never removes.
    Union,
    Max,
    FirstWins,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordField {
    NativeId,
    Link,
    PointerObservedAt,
    NaturalKey,
    Title,
    Description,
    LocationText,
    RateText,
    ScheduleText,
    PostalCode,
    Coords,
    Rate,
    Subjects,
    Levels,
    Availability,
    Tags,
    ParseQuality,
    FirstObserved,
    LastObserved,
    BumpedAt,
}

pub const MERGE_POLICY: &[(RecordField, FieldPolicy)] = &[
    (RecordField::NativeId, FieldPolicy::ReplaceIfNewer),
    (RecordField::Link, FieldPolicy::ReplaceIfNewer),
    (RecordField::PointerObservedAt, FieldPolicy::Max),
    (RecordField::NaturalKey, FieldPolicy::FirstWins),
    (RecordField::Title, FieldPolicy::ReplaceIfBetterQuality),
    (RecordField::Description, FieldPolicy::ReplaceIfBetterQuality),
    (RecordField::LocationText, FieldPolicy::ReplaceIfBetterQuality),
    (RecordField::RateText, FieldPolicy::ReplaceIfBetterQuality),
    (RecordField::ScheduleText, FieldPolicy::ReplaceIfBetterQuality),
    (RecordField::PostalCode, FieldPolicy::ReplaceIfBetterQuality),
    (RecordField::Coords, FieldPolicy::ReplaceIfBetterQuality),
    (RecordField::Rate, FieldPolicy::ReplaceIfBetterQuality),
    (RecordField::Subjects, FieldPolicy::Union),
    (RecordField::Levels, FieldPolicy::Union),
    (RecordField::Availability, FieldPolicy::Union),
    (RecordField::Tags, FieldPolicy::Union),
    (RecordField::ParseQuality, FieldPolicy::Max),
    (RecordField::FirstObserved, FieldPolicy::FirstWins),
    (RecordField::LastObserved, FieldPolicy::Max),
    (RecordField::BumpedAt, FieldPolicy::Max),
];

/// Facts about the incoming observation shared by all field policies.
#[derive(Debug, Clone, Copy)]
struct MergeContext {
    pointer_is_newer: bool,
    quality_ok: bool,
}

/// A scalar slot the generic merge can fill. Types without a natural order
/// never win a `Max` comparison against an existing value.
trait MergeSlot {
    fn is_blank(&self) -> bool {
        false
    }

    fn exceeds(&self, _current: &Self) -> bool {
        false
    }
}

impl MergeSlot for String {
    fn is_blank(&self) -> bool {
        self.trim().is_empty()
    }

    fn exceeds(&self, current: &Self) -> bool {
        self > current
    }
}

impl MergeSlot for DateTime<Utc> {
    fn exceeds(&self, current: &Self) -> bool {
        self > current
    }
}

impl MergeSlot for GeoPoint {}
impl MergeSlot for RateRange {}

fn merge_option<T>(slot: &mut Option<T>, incoming: Option<T>, policy: FieldPolicy, ctx: MergeContext)
where
    T: MergeSlot,
{
    let Some(incoming) = incoming else {
        return;
    };
    if incoming.is_blank() {
        return;
    }
    let slot_empty = slot.as_ref().is_none_or(MergeSlot::is_blank);

    let replace = match policy {
        FieldPolicy::ReplaceIfNewer => ctx.pointer_is_newer || slot_empty,
        FieldPolicy::ReplaceIfBetterQuality => ctx.quality_ok || slot_empty,
        FieldPolicy::FirstWins | FieldPolicy::Union => slot_empty,
        FieldPolicy::Max => slot.as_ref().is_none_or(|current| incoming.exceeds(current)),
    };
    if replace {
        *slot = Some(incoming);
    }
}

fn merge_value<T: PartialOrd>(slot: &mut T, incoming: T, policy: FieldPolicy, ctx: MergeContext) {
    let replace = match policy {
        FieldPolicy::ReplaceIfNewer => ctx.pointer_is_newer,
        FieldPolicy::ReplaceIfBetterQuality => ctx.quality_ok,
        FieldPolicy::Max => incoming > *slot,
        FieldPolicy::FirstWins | FieldPolicy::Union => false,
    };
    if replace {
        *slot = incoming;
    }
}

fn merge_set(
    slot: &mut BTreeSet<String>,
    incoming: &BTreeSet<String>,
    policy: FieldPolicy,
    ctx: MergeContext,
) {
    if incoming.is_empty() {
        return;
    }
    match policy {
        FieldPolicy::Union | FieldPolicy::Max => slot.extend(incoming.iter().cloned()),
        FieldPolicy::ReplaceIfNewer if ctx.pointer_is_newer => *slot = incoming.clone(),
        FieldPolicy::ReplaceIfBetterQuality if ctx.quality_ok => *slot = incoming.clone(),
        _ if slot.is_empty() => *slot = incoming.clone(),
        _ => {}
    }
}

fn apply_field(
    record: &mut CanonicalRecord,
    draft: &RecordDraft,
    field: RecordField,
    policy: FieldPolicy,
    ctx: MergeContext,
) {
    match field {
        RecordField::NativeId => merge_option(
            &mut record.native_id,
            Some(draft.native_id.clone()),
            policy,
            ctx,
        ),
        RecordField::Link => merge_option(&mut record.link, draft.link.clone(), policy, ctx),
        RecordField::PointerObservedAt => merge_option(
            &mut record.pointer_observed_at,
            Some(draft.observed_at),
            policy,
            ctx,
        ),
        RecordField::NaturalKey => {
            merge_option(&mut record.natural_key, draft.natural_key.clone(), policy, ctx)
        }
        RecordField::Title => merge_option(&mut record.title, draft.title.clone(), policy, ctx),
        RecordField::Description => {
            merge_option(&mut record.description, draft.description.clone(), policy, ctx)
        }
        RecordField::LocationText => merge_option(
            &mut record.location_text,
            draft.location_text.clone(),
            policy,
            ctx,
        ),
        RecordField::RateText => {
            merge_option(&mut record.rate_text, draft.rate_text.clone(), policy, ctx)
        }
        RecordField::ScheduleText => merge_option(
            &mut record.schedule_text,
            draft.schedule_text.clone(),
            policy,
            ctx,
        ),
        RecordField::PostalCode => merge_option(
            &mut record.signals.postal_code,
            draft.signals.postal_code.clone(),
            policy,
            ctx,
        ),
        RecordField::Coords => {
            merge_option(&mut record.signals.coords, draft.signals.coords, policy, ctx)
        }
        RecordField::Rate => merge_option(&mut record.signals.rate, draft.signals.rate, policy, ctx),
        RecordField::Subjects => merge_set(
            &mut record.signals.subjects,
            &draft.signals.subjects,
            policy,
            ctx,
        ),
        RecordField::Levels => {
            merge_set(&mut record.signals.levels, &draft.signals.levels, policy, ctx)
        }
        RecordField::Availability => merge_set(
            &mut record.signals.availability,
            &draft.signals.availability,
            policy,
            ctx,
        ),
        RecordField::Tags => merge_set(&mut record.signals.tags, &draft.signals.tags, policy, ctx),
        RecordField::ParseQuality => {
            merge_value(&mut record.parse_quality, draft.parse_quality, policy, ctx)
        }
        RecordField::FirstObserved => {
            merge_value(&mut record.first_observed, draft.observed_at, policy, ctx)
        }
        RecordField::LastObserved => {
            merge_value(&mut record.last_observed, draft.observed_at, policy, ctx)
        }
        RecordField::BumpedAt => {
            // A different native unit re-posting the same entity is a bump.
            let bump = (record.native_id.as_deref() != Some(draft.native_id.as_str()))
                .then_some(draft.observed_at);
            merge_option(&mut record.bumped_at, bump, policy, ctx);
        }
    }
}

/// Record status state machine.
///
/// `open → closed` on a close signal; `closed`/`expired` stay put unless an
/// explicit reopen arrives. `open → expired` happens outside the merge.
pub fn next_status(current: RecordStatus, signal: Option<StatusSignal>) -> RecordStatus {
    match (current, signal) {
        (RecordStatus::Open | RecordStatus::Expired, Some(StatusSignal::Close)) => {
            RecordStatus::Closed
        }
        (RecordStatus::Closed | RecordStatus::Expired, Some(StatusSignal::Reopen)) => {
            RecordStatus::Open
        }
        (status, _) => status,
    }
}

/// Build a fresh record from the first observation of an entity.
pub fn new_record(draft: &RecordDraft, now: DateTime<Utc>) -> CanonicalRecord {
    CanonicalRecord {
        id: Uuid::new_v4(),
        record_key: draft.record_key.clone(),
        source_id: draft.source_id.clone(),
        natural_key: draft.natural_key.clone(),
        native_id: Some(draft.native_id.clone()),
        link: draft.link.clone(),
        pointer_observed_at: Some(draft.observed_at),
        title: draft.title.clone(),
        description: draft.description.clone(),
        location_text: draft.location_text.clone(),
        rate_text: draft.rate_text.clone(),
        schedule_text: draft.schedule_text.clone(),
        signals: draft.signals.clone(),
        parse_quality: draft.parse_quality,
        status: next_status(RecordStatus::Open, draft.status_signal),
        first_observed: draft.observed_at,
        last_observed: draft.observed_at,
        bumped_at: None,
        duplicate_group_id: None,
        is_primary_in_group: false,
        duplicate_confidence_score: None,
        created_at: now,
        updated_at: now,
    }
}

/// Merge `draft` into `existing` according to [`MERGE_POLICY`].
pub fn merge_record(
    existing: &CanonicalRecord,
    draft: &RecordDraft,
    now: DateTime<Utc>,
) -> CanonicalRecord {
    let ctx = MergeContext {
        pointer_is_newer: existing.native_id.is_none()
            || existing
                .pointer_observed_at
                .is_none_or(|stored| draft.observed_at >= stored),
        quality_ok: draft.parse_quality >= existing.parse_quality,
    };

    let mut merged = existing.clone();
    if draft.is_signal_only() {
        // A status update is an observation, not a new representative unit.
        apply_field(&mut merged, draft, RecordField::LastObserved, FieldPolicy::Max, ctx);
    } else {
        for (field, policy) in MERGE_POLICY {
            // Bump detection compares against the pointer before it moves.
            if *field == RecordField::NativeId {
                apply_field(&mut merged, draft, RecordField::BumpedAt, FieldPolicy::Max, ctx);
            }
            if *field != RecordField::BumpedAt {
                apply_field(&mut merged, draft, *field, *policy, ctx);
            }
        }
    }

    // Lifecycle signals from a stale, non-pointer unit are ignored.
    let signal_applies =
        ctx.pointer_is_newer || existing.native_id.as_deref() == Some(draft.native_id.as_str());
    if signal_applies {
        merged.status = next_status(existing.status, draft.status_signal);
    }

    merged.updated_at = now;
    merged
}
