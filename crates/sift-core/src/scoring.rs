//! Weighted similarity between two canonical records.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::TimeDelta;
use serde::Serialize;

use crate::enrich::availability;
use crate::models::CanonicalRecord;

pub const LOCATION_EXACT: f32 = 40.0;
pub const LOCATION_ONE_EDIT: f32 = 30.0;
pub const LOCATION_TWO_EDITS: f32 = 20.0;
pub const KEY_EXACT: f32 = 40.0;
pub const KEY_ONE_EDIT: f32 = 30.0;
pub const KEY_NEAR: f32 = 20.0;
pub const PRIMARY_WEIGHT: f32 = 30.0;
pub const SECONDARY_WEIGHT: f32 = 20.0;
pub const RATE_OVERLAP: f32 = 10.0;
pub const SCHEDULE_OVERLAP: f32 = 5.0;
pub const TEMPORAL_NEAR: f32 = 5.0;
pub const TEMPORAL_FAR: f32 = 3.0;
pub const MAX_SCORE: f32 = 100.0;

/// Digits of the postal code that must agree for a fuzzy location match.
const LOCATION_PREFIX: usize = 2;

/// Duplicate-detection tuning.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Only records last observed within this window are candidates.
    pub window: Duration,
    /// Candidates below this score are ignored.
    pub floor: f32,
    pub medium: f32,
    pub high: f32,
    /// Group low-band matches too.
    pub auto_group_low: bool,
    pub candidate_limit: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(7 * 24 * 3600),
            floor: 60.0,
            medium: 70.0,
            high: 85.0,
            auto_group_low: false,
            candidate_limit: 200,
        }
    }
}

impl DedupConfig {
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_auto_group_low(mut self, enabled: bool) -> Self {
        self.auto_group_low = enabled;
        self
    }

    /// Confidence band for a score, `None` below the floor.
    pub fn band(&self, score: f32) -> Option<Band> {
        if score >= self.high {
            Some(Band::High)
        } else if score >= self.medium {
            Some(Band::Medium)
        } else if score >= self.floor {
            Some(Band::Low)
        } else {
            None
        }
    }

    /// Whether a match in `band` joins a group automatically.
    pub fn groups(&self, band: Band) -> bool {
        match band {
            Band::High | Band::Medium => true,
            Band::Low => self.auto_group_low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    High,
    Medium,
    Low,
}

/// Per-term contributions; `total()` is the capped sum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub location: f32,
    pub natural_key: f32,
    pub primary: f32,
    pub secondary: f32,
    pub rate: f32,
    pub schedule: f32,
    pub temporal: f32,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f32 {
        let sum = self.location
            + self.natural_key
            + self.primary
            + self.secondary
            + self.rate
            + self.schedule
            + self.temporal;
        sum.clamp(0.0, MAX_SCORE)
    }
}

/// Size of the intersection over the size of the union; two empty sets score 0.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

fn location_score(a: Option<&str>, b: Option<&str>) -> f32 {
    let (Some(a), Some(b)) = (a, b) else {
        return 0.0;
    };
    if a == b {
        return LOCATION_EXACT;
    }
    if a.len() != b.len() || a.get(..LOCATION_PREFIX) != b.get(..LOCATION_PREFIX) {
        return 0.0;
    }
    let edits = a.chars().zip(b.chars()).filter(|(x, y)| x != y).count();
    match edits {
        1 => LOCATION_ONE_EDIT,
        2 => LOCATION_TWO_EDITS,
        _ => 0.0,
    }
}

fn natural_key_score(a: Option<&str>, b: Option<&str>) -> f32 {
    let (Some(a), Some(b)) = (a, b) else {
        return 0.0;
    };
    let (a, b) = (a.to_uppercase(), b.to_uppercase());
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return KEY_EXACT;
    }
    let distance = strsim::levenshtein(&a, &b);
    let prefix = a.len().min(b.len()) >= 3 && (a.starts_with(&b) || b.starts_with(&a));
    if distance <= 1 {
        KEY_ONE_EDIT
    } else if distance <= 2 || prefix {
        KEY_NEAR
    } else {
        0.0
    }
}

fn temporal_score(a: &CanonicalRecord, b: &CanonicalRecord) -> f32 {
    let gap = (a.last_observed - b.last_observed).abs();
    if gap <= TimeDelta::hours(48) {
        TEMPORAL_NEAR
    } else if gap <= TimeDelta::hours(96) {
        TEMPORAL_FAR
    } else {
        0.0
    }
}

/// Score two records. Missing fields contribute nothing.
pub fn score(a: &CanonicalRecord, b: &CanonicalRecord) -> ScoreBreakdown {
    let rate = match (&a.signals.rate, &b.signals.rate) {
        (Some(x), Some(y)) if x.intersects(y) => RATE_OVERLAP,
        _ => 0.0,
    };
    let schedule = if availability::overlaps(&a.signals.availability, &b.signals.availability) {
        SCHEDULE_OVERLAP
    } else {
        0.0
    };

    ScoreBreakdown {
        location: location_score(
            a.signals.postal_code.as_deref(),
            b.signals.postal_code.as_deref(),
        ),
        natural_key: natural_key_score(a.natural_key.as_deref(), b.natural_key.as_deref()),
        primary: jaccard(&a.signals.subjects, &b.signals.subjects) * PRIMARY_WEIGHT,
        secondary: jaccard(&a.signals.levels, &b.signals.levels) * SECONDARY_WEIGHT,
        rate,
        schedule,
        temporal: temporal_score(a, b),
    }
}
