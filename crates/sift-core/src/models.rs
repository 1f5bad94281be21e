use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Producer contract for a captured message, upserted on `(source_id, native_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRawUnit {
    pub source_id: String,
    pub native_id: String,
    pub text: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub forwarded: bool,
    /// Permalink to the message in the source feed.
    #[serde(default)]
    pub link: Option<String>,
}

/// A stored raw unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawUnit {
    pub id: Uuid,
    pub source_id: String,
    pub native_id: String,
    pub text: String,
    pub captured_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub forwarded: bool,
    pub link: Option<String>,
    /// SHA-256 over text and flags, used to detect no-op re-deliveries.
    pub content_hash: String,
}

impl RawUnit {
    /// Source timestamp of this observation: the edit time when edited.
    pub fn observed_at(&self) -> DateTime<Utc> {
        self.edited_at.unwrap_or(self.captured_at)
    }

    /// Leading slice of the text for diagnostics.
    pub fn snippet(&self, max_chars: usize) -> String {
        self.text.chars().take(max_chars).collect()
    }
}

impl NewRawUnit {
    pub fn content_hash(&self) -> String {
        compute_hash(&format!(
            "{}\u{1f}{}\u{1f}{}",
            self.text, self.deleted, self.forwarded
        ))
    }
}

/// Approximate coordinates resolved from a postal code.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// Hourly rate range, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateRange {
    pub min: f64,
    pub max: f64,
}

impl RateRange {
    pub fn new(a: f64, b: f64) -> Self {
        if a <= b {
            Self { min: a, max: b }
        } else {
            Self { min: b, max: a }
        }
    }

    pub fn intersects(&self, other: &RateRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }
}

/// Deterministically derived attributes used for matching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalBundle {
    /// Primary categories.
    #[serde(default)]
    pub subjects: BTreeSet<String>,
    /// Secondary categories.
    #[serde(default)]
    pub levels: BTreeSet<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub coords: Option<GeoPoint>,
    #[serde(default)]
    pub rate: Option<RateRange>,
    /// Day/time-slot tags such as `mon:evening`.
    #[serde(default)]
    pub availability: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// Explicit lifecycle signal carried by an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusSignal {
    Close,
    Reopen,
}

/// Structured result of the pipeline stages for one raw unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedOutput {
    pub natural_key: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub location_text: Option<String>,
    pub rate_text: Option<String>,
    pub schedule_text: Option<String>,
    pub signals: SignalBundle,
    pub status_signal: Option<StatusSignal>,
    /// 0.0..=1.0
    pub parse_quality: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Open,
    Closed,
    Expired,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Open => "open",
            RecordStatus::Closed => "closed",
            RecordStatus::Expired => "expired",
        }
    }

    pub fn is_open(&self) -> bool {
        *self == RecordStatus::Open
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(RecordStatus::Open),
            "closed" => Ok(RecordStatus::Closed),
            "expired" => Ok(RecordStatus::Expired),
            _ => Err(format!("Unknown record status: {}", s)),
        }
    }
}

/// Build the lookup key for a record.
///
/// The source-provided natural identifier wins when present; otherwise the
/// record is keyed by the native message id.
pub fn record_key(source_id: &str, natural_key: Option<&str>, native_id: &str) -> String {
    match natural_key {
        Some(code) => format!("{source_id}:code:{}", code.to_uppercase()),
        None => format!("{source_id}:msg:{native_id}"),
    }
}

/// One logical row per real-world entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: Uuid,
    pub record_key: String,
    pub source_id: String,
    pub natural_key: Option<String>,
    /// Pointer fields: the unit that currently represents this record.
    pub native_id: Option<String>,
    pub link: Option<String>,
    pub pointer_observed_at: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub location_text: Option<String>,
    pub rate_text: Option<String>,
    pub schedule_text: Option<String>,
    pub signals: SignalBundle,
    pub parse_quality: f32,
    pub status: RecordStatus,
    pub first_observed: DateTime<Utc>,
    pub last_observed: DateTime<Utc>,
    pub bumped_at: Option<DateTime<Utc>>,
    pub duplicate_group_id: Option<Uuid>,
    pub is_primary_in_group: bool,
    pub duplicate_confidence_score: Option<f32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An incoming observation of a record, ready for merge.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDraft {
    pub record_key: String,
    pub source_id: String,
    pub natural_key: Option<String>,
    pub native_id: String,
    pub link: Option<String>,
    /// Source timestamp (edit time if edited, else capture time).
    pub observed_at: DateTime<Utc>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub location_text: Option<String>,
    pub rate_text: Option<String>,
    pub schedule_text: Option<String>,
    pub signals: SignalBundle,
    pub parse_quality: f32,
    pub status_signal: Option<StatusSignal>,
}

impl RecordDraft {
    pub fn from_parsed(raw: &RawUnit, parsed: ParsedOutput) -> Self {
        Self {
            record_key: record_key(&raw.source_id, parsed.natural_key.as_deref(), &raw.native_id),
            source_id: raw.source_id.clone(),
            natural_key: parsed.natural_key,
            native_id: raw.native_id.clone(),
            link: raw.link.clone(),
            observed_at: raw.observed_at(),
            title: parsed.title,
            description: parsed.description,
            location_text: parsed.location_text,
            rate_text: parsed.rate_text,
            schedule_text: parsed.schedule_text,
            signals: parsed.signals,
            parse_quality: parsed.parse_quality,
            status_signal: parsed.status_signal,
        }
    }

    /// True when the draft carries a lifecycle signal and nothing else.
    pub fn is_signal_only(&self) -> bool {
        self.status_signal.is_some()
            && self.title.is_none()
            && self.description.is_none()
            && self.signals == SignalBundle::default()
    }

    /// A lifecycle-only observation (source deletion, status update) carrying no content.
    pub fn signal(raw: &RawUnit, record_key: String, signal: StatusSignal) -> Self {
        Self {
            status_signal: Some(signal),
            ..Self::close_signal(raw, record_key)
        }
    }

    /// A close-only observation (source deletion) carrying no content.
    pub fn close_signal(raw: &RawUnit, record_key: String) -> Self {
        Self {
            record_key,
            source_id: raw.source_id.clone(),
            natural_key: None,
            native_id: raw.native_id.clone(),
            link: None,
            observed_at: raw.observed_at(),
            title: None,
            description: None,
            location_text: None,
            rate_text: None,
            schedule_text: None,
            signals: SignalBundle::default(),
            parse_quality: 0.0,
            status_signal: Some(StatusSignal::Close),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Active,
    Resolved,
    Invalid,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Active => "active",
            GroupStatus::Resolved => "resolved",
            GroupStatus::Invalid => "invalid",
        }
    }
}

impl FromStr for GroupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(GroupStatus::Active),
            "resolved" => Ok(GroupStatus::Resolved),
            "invalid" => Ok(GroupStatus::Invalid),
            _ => Err(format!("Unknown group status: {}", s)),
        }
    }
}

/// Records believed to describe the same real-world entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: Uuid,
    pub primary_record_id: Uuid,
    pub member_count: u32,
    pub avg_confidence: f32,
    pub status: GroupStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
