//! Cross-source duplicate detection and group maintenance.

use std::cmp::Ordering;

use chrono::{TimeDelta, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{CanonicalRecord, GroupStatus};
use crate::scoring::{Band, DedupConfig, ScoreBreakdown, score};
use crate::traits::{GroupCreation, GroupMember, GroupStore, RecordStore};

/// A record from another source that scored at or above the floor.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub record: CanonicalRecord,
    pub breakdown: ScoreBreakdown,
    pub score: f32,
    pub band: Band,
}

/// What duplicate detection did for one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupOutcome {
    /// Group the record belongs to afterwards, if any.
    pub group_id: Option<Uuid>,
    pub created_group: bool,
    /// `(record_id, score)` pairs that drove grouping.
    pub matched: Vec<(Uuid, f32)>,
    /// Low-band matches surfaced for review but not grouped.
    pub flagged: Vec<(Uuid, f32)>,
    /// Other active groups the record also matched.
    pub skipped_groups: Vec<Uuid>,
}

/// Ranking used to pick a group's primary: higher parse quality, then
/// earlier first observation, then presence of a natural key.
pub fn primary_order(a: &CanonicalRecord, b: &CanonicalRecord) -> Ordering {
    b.parse_quality
        .total_cmp(&a.parse_quality)
        .then(a.first_observed.cmp(&b.first_observed))
        .then(b.natural_key.is_some().cmp(&a.natural_key.is_some()))
        .then(a.id.cmp(&b.id))
}

/// Best open record among `members`.
pub fn elect_primary<'a>(
    members: impl IntoIterator<Item = &'a CanonicalRecord>,
) -> Option<&'a CanonicalRecord> {
    members
        .into_iter()
        .filter(|m| m.status.is_open())
        .min_by(|a, b| primary_order(a, b))
}

#[derive(Clone)]
pub struct DuplicateDetector<R, G>
where
    R: RecordStore,
    G: GroupStore,
{
    records: R,
    groups: G,
    config: DedupConfig,
}

impl<R, G> DuplicateDetector<R, G>
where
    R: RecordStore,
    G: GroupStore,
{
    pub fn new(records: R, groups: G, config: DedupConfig) -> Self {
        Self {
            records,
            groups,
            config,
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Open records from other sources in the recency window scoring at or
    /// above the floor, best first.
    pub async fn find_candidates(
        &self,
        record: &CanonicalRecord,
    ) -> Result<Vec<ScoredCandidate>, AppError> {
        let window = TimeDelta::from_std(self.config.window).unwrap_or(TimeDelta::days(7));
        let since = Utc::now() - window;
        let pool = self
            .records
            .recent_candidates(&record.source_id, since, self.config.candidate_limit)
            .await?;

        let mut scored: Vec<ScoredCandidate> = pool
            .into_iter()
            .filter(|c| c.id != record.id && c.source_id != record.source_id)
            .filter(|c| c.status.is_open())
            .filter_map(|c| {
                let breakdown = score(record, &c);
                let total = breakdown.total();
                self.config.band(total).map(|band| ScoredCandidate {
                    record: c,
                    breakdown,
                    score: total,
                    band,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(scored)
    }

    /// Score a freshly persisted record and update group membership.
    pub async fn process(&self, record: &CanonicalRecord) -> Result<DedupOutcome, AppError> {
        if !record.status.is_open() {
            return Ok(DedupOutcome::default());
        }
        if let Some(group_id) = record.duplicate_group_id {
            let active = self
                .groups
                .get_group(group_id)
                .await?
                .is_some_and(|g| g.status == GroupStatus::Active);
            if active {
                tracing::debug!(record_id = %record.id, %group_id, "Record already grouped");
                return Ok(DedupOutcome {
                    group_id: Some(group_id),
                    ..Default::default()
                });
            }
        }

        let candidates = self.find_candidates(record).await?;
        let (groupable, flagged): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|c| self.config.groups(c.band));

        for low in &flagged {
            tracing::info!(
                record_id = %record.id,
                candidate_id = %low.record.id,
                score = low.score,
                "Low-confidence duplicate flagged"
            );
        }

        let mut outcome = DedupOutcome {
            flagged: flagged.iter().map(|c| (c.record.id, c.score)).collect(),
            ..Default::default()
        };
        if groupable.is_empty() {
            return Ok(outcome);
        }

        let decision = self.create_or_update_group(record, &groupable).await?;
        outcome.group_id = decision.group_id;
        outcome.created_group = decision.created_group;
        outcome.matched = decision.matched;
        outcome.skipped_groups = decision.skipped_groups;
        Ok(outcome)
    }

    /// Attach `record` to the group of its best-scoring grouped match, or
    /// create a new group with every ungrouped match.
    ///
    /// When matches span several active groups, only the group containing
    /// the highest-scoring match is joined (ties: larger group, then older
    /// group). Groups are never merged.
    pub async fn create_or_update_group(
        &self,
        record: &CanonicalRecord,
        matches: &[ScoredCandidate],
    ) -> Result<DedupOutcome, AppError> {
        let Some(best) = matches.iter().map(|m| m.score).reduce(f32::max) else {
            return Ok(DedupOutcome::default());
        };

        // Best score seen against each existing group.
        let mut group_scores: Vec<(Uuid, f32)> = Vec::new();
        for m in matches {
            let Some(group_id) = m.record.duplicate_group_id else {
                continue;
            };
            match group_scores.iter_mut().find(|(id, _)| *id == group_id) {
                Some((_, s)) => *s = s.max(m.score),
                None => group_scores.push((group_id, m.score)),
            }
        }

        let mut active = Vec::new();
        for (group_id, group_score) in group_scores {
            match self.groups.get_group(group_id).await? {
                Some(group) if group.status == GroupStatus::Active => {
                    active.push((group, group_score))
                }
                _ => {}
            }
        }

        if active.is_empty() {
            return self.create_group(record, matches, best).await;
        }

        active.sort_by(|(ga, sa), (gb, sb)| {
            sb.total_cmp(sa)
                .then(gb.member_count.cmp(&ga.member_count))
                .then(ga.created_at.cmp(&gb.created_at))
        });
        let (target, target_score) = active.remove(0);
        let skipped_groups: Vec<Uuid> = active.iter().map(|(g, _)| g.id).collect();
        if !skipped_groups.is_empty() {
            tracing::warn!(
                record_id = %record.id,
                group_id = %target.id,
                skipped = ?skipped_groups,
                "Record matches several groups, joining the highest-scoring one"
            );
        }

        self.join_group(record, target.id, target_score, matches, skipped_groups)
            .await
    }

    async fn join_group(
        &self,
        record: &CanonicalRecord,
        group_id: Uuid,
        score: f32,
        matches: &[ScoredCandidate],
        skipped_groups: Vec<Uuid>,
    ) -> Result<DedupOutcome, AppError> {
        let group = self
            .groups
            .add_member(
                group_id,
                GroupMember {
                    record_id: record.id,
                    score,
                },
            )
            .await?;

        let current = self.records.get(group.primary_record_id).await?;
        let takes_over = match &current {
            Some(primary) if primary.status.is_open() => {
                primary_order(record, primary) == Ordering::Less
            }
            _ => true,
        };
        if takes_over {
            self.groups.set_primary(group.id, record.id).await?;
            tracing::info!(group_id = %group.id, record_id = %record.id, "New primary elected");
        }

        tracing::info!(
            record_id = %record.id,
            group_id = %group.id,
            score,
            "Record joined duplicate group"
        );

        Ok(DedupOutcome {
            group_id: Some(group.id),
            created_group: false,
            matched: matches
                .iter()
                .filter(|m| m.record.duplicate_group_id == Some(group.id))
                .map(|m| (m.record.id, m.score))
                .collect(),
            skipped_groups,
            ..Default::default()
        })
    }

    /// Re-read each match so its group membership is current.
    async fn refresh_matches(
        &self,
        matches: &[ScoredCandidate],
    ) -> Result<Vec<ScoredCandidate>, AppError> {
        let mut refreshed = Vec::with_capacity(matches.len());
        for m in matches {
            let record = self
                .records
                .get(m.record.id)
                .await?
                .unwrap_or_else(|| m.record.clone());
            refreshed.push(ScoredCandidate {
                record,
                ..m.clone()
            });
        }
        Ok(refreshed)
    }

    async fn create_group(
        &self,
        record: &CanonicalRecord,
        matches: &[ScoredCandidate],
        best: f32,
    ) -> Result<DedupOutcome, AppError> {
        let primary = elect_primary(
            std::iter::once(record).chain(matches.iter().map(|m| &m.record)),
        )
        .map_or(record.id, |p| p.id);

        let members: Vec<GroupMember> = std::iter::once(GroupMember {
            record_id: record.id,
            score: best,
        })
        .chain(matches.iter().map(|m| GroupMember {
            record_id: m.record.id,
            score: m.score,
        }))
        .collect();

        let group = match self.groups.create_group(primary, &members).await? {
            GroupCreation::Created(group) => group,
            GroupCreation::AlreadyGrouped(group_id) => {
                // Another worker grouped one of the matches since they were read.
                tracing::info!(
                    record_id = %record.id,
                    %group_id,
                    "Match was grouped concurrently, joining its group"
                );
                let current = self.records.get(record.id).await?;
                let refreshed = self.refresh_matches(matches).await?;
                let matched: Vec<(Uuid, f32)> = refreshed
                    .iter()
                    .filter(|m| m.record.duplicate_group_id == Some(group_id))
                    .map(|m| (m.record.id, m.score))
                    .collect();
                if current.and_then(|r| r.duplicate_group_id) == Some(group_id) {
                    return Ok(DedupOutcome {
                        group_id: Some(group_id),
                        matched,
                        ..Default::default()
                    });
                }
                let score = matched.iter().map(|(_, s)| *s).reduce(f32::max).unwrap_or(best);
                return self
                    .join_group(record, group_id, score, &refreshed, Vec::new())
                    .await;
            }
        };
        tracing::info!(
            group_id = %group.id,
            primary_id = %primary,
            members = group.member_count,
            "Duplicate group created"
        );

        Ok(DedupOutcome {
            group_id: Some(group.id),
            created_group: true,
            matched: matches.iter().map(|m| (m.record.id, m.score)).collect(),
            ..Default::default()
        })
    }

    /// Re-elect the primary when `record` (now closed or expired) held it.
    ///
    /// A group left without open members is marked resolved. Returns the
    /// new primary, if one was elected.
    pub async fn on_record_closed(
        &self,
        record: &CanonicalRecord,
    ) -> Result<Option<Uuid>, AppError> {
        let Some(group_id) = record.duplicate_group_id else {
            return Ok(None);
        };
        let Some(group) = self.groups.get_group(group_id).await? else {
            return Ok(None);
        };
        if group.status != GroupStatus::Active {
            return Ok(None);
        }

        let members = self.groups.list_members(group_id).await?;
        let open: Vec<&CanonicalRecord> = members
            .iter()
            .filter(|m| m.id != record.id && m.status.is_open())
            .collect();

        if open.is_empty() {
            self.groups
                .set_status(group_id, GroupStatus::Resolved)
                .await?;
            tracing::info!(%group_id, "Duplicate group resolved, no open members left");
            return Ok(None);
        }

        if group.primary_record_id != record.id {
            return Ok(None);
        }

        let Some(next) = elect_primary(open) else {
            return Ok(None);
        };
        self.groups.set_primary(group_id, next.id).await?;
        tracing::info!(%group_id, old_primary = %record.id, new_primary = %next.id, "Primary re-elected");
        Ok(Some(next.id))
    }
}
