//! Heuristic pre-filters. Pure functions over the raw text, no external calls.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::models::StatusSignal;

/// Minimum number of non-whitespace characters for a unit to carry an entity.
const MIN_CONTENT_CHARS: usize = 15;

/// Status-only updates are short by nature.
const STATUS_ONLY_MAX_CHARS: usize = 120;

/// Redirect posts carry a link plus very little text.
const REDIRECT_MAX_WORDS: usize = 15;

/// Shared result of every pre-filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    Filtered { reason: String },
    Passthrough,
}

impl FilterOutcome {
    pub fn filtered(reason: impl Into<String>) -> Self {
        FilterOutcome::Filtered {
            reason: reason.into(),
        }
    }

    pub fn is_filtered(&self) -> bool {
        matches!(self, FilterOutcome::Filtered { .. })
    }
}

/// A candidate identifier that does not occur verbatim in the raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnverifiedIdentifier {
    pub candidate: String,
}

impl fmt::Display for UnverifiedIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "identifier '{}' is not present in the source text", self.candidate)
    }
}

impl std::error::Error for UnverifiedIdentifier {}

/// Loose identifier shapes, including spaced and hyphenated spellings.
static CANDIDATE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Za-z]{1,2})[ \-]?(\d{3,5})\b").unwrap());

static URL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"https?://\S+").unwrap());

static STATUS_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(taken|closed|filled|expired|re-?opened|still available|available again)\b")
        .unwrap()
});

static REDIRECT_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(join|visit|see|check out|click|follow|subscribe|more assignments at|full list)\b")
        .unwrap()
});

static ADMIN_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(channel rules|announcement|admins?|maintenance|pinned|welcome to|we are hiring|terms and conditions|giveaway)\b",
    )
    .unwrap()
});

/// Forwarded and empty units never carry a first-hand entity.
pub fn filter_unit(text: &str, forwarded: bool) -> FilterOutcome {
    if forwarded {
        return FilterOutcome::filtered("forwarded");
    }
    let visible = text.chars().filter(|c| !c.is_whitespace()).count();
    if visible < MIN_CONTENT_CHARS {
        return FilterOutcome::filtered("empty");
    }
    FilterOutcome::Passthrough
}

/// Status-only, redirect and administrative posts.
pub fn filter_non_entity(text: &str) -> FilterOutcome {
    let trimmed = text.trim();

    if trimmed.chars().count() <= STATUS_ONLY_MAX_CHARS && STATUS_WORDS.is_match(trimmed) {
        return FilterOutcome::filtered("status_only");
    }

    if URL.is_match(trimmed) {
        let remainder = URL.replace_all(trimmed, " ");
        let words = remainder.split_whitespace().count();
        if words <= REDIRECT_MAX_WORDS && REDIRECT_WORDS.is_match(&remainder) {
            return FilterOutcome::filtered("redirect");
        }
    }

    if ADMIN_WORDS.is_match(trimmed) && candidate_identifiers(trimmed).is_empty() {
        return FilterOutcome::filtered("administrative");
    }

    FilterOutcome::Passthrough
}

/// A short status update naming exactly one verifiable identifier.
///
/// Returns the identifier and the signal it carries; the caller applies it
/// to an existing record instead of filtering the unit.
pub fn status_update(text: &str) -> Option<(String, StatusSignal)> {
    let trimmed = text.trim();
    if trimmed.chars().count() > STATUS_ONLY_MAX_CHARS {
        return None;
    }
    let signal = detect_status_word(trimmed)?;
    let (verified, _) = verify_all(trimmed, &candidate_identifiers(trimmed));
    match verified.as_slice() {
        [code] => Some((code.clone(), signal)),
        _ => None,
    }
}

fn detect_status_word(text: &str) -> Option<StatusSignal> {
    let mut signal = None;
    for m in STATUS_WORDS.find_iter(text) {
        let word = m.as_str().to_lowercase();
        if word.starts_with("re") || word.contains("available") {
            return Some(StatusSignal::Reopen);
        }
        signal = Some(StatusSignal::Close);
    }
    signal
}

/// Canonical form of an identifier: alphanumerics only, uppercase.
pub fn normalize_identifier(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Every identifier-shaped token in the text, normalized and deduplicated,
/// in order of first appearance.
pub fn candidate_identifiers(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    CANDIDATE_CODE
        .find_iter(text)
        .map(|m| normalize_identifier(m.as_str()))
        .filter(|code| seen.insert(code.clone()))
        .collect()
}

/// Accept `candidate` only if its normalized form occurs verbatim in `text`.
pub fn verify_identifier(candidate: &str, text: &str) -> Result<String, UnverifiedIdentifier> {
    let code = normalize_identifier(candidate);
    if code.is_empty() || find_verbatim(text, &code).is_none() {
        return Err(UnverifiedIdentifier {
            candidate: candidate.to_string(),
        });
    }
    Ok(code)
}

/// Split candidates into verified identifiers and discarded tokens.
pub fn verify_all(text: &str, candidates: &[String]) -> (Vec<String>, Vec<String>) {
    let mut verified = Vec::new();
    let mut discarded = Vec::new();
    for candidate in candidates {
        match verify_identifier(candidate, text) {
            Ok(code) if !verified.contains(&code) => verified.push(code),
            Ok(_) => {}
            Err(e) => discarded.push(e.candidate),
        }
    }
    (verified, discarded)
}

/// Byte offset of a whole-token, case-insensitive occurrence of `code`.
fn find_verbatim(text: &str, code: &str) -> Option<usize> {
    let haystack = text.to_ascii_uppercase();
    let bytes = haystack.as_bytes();
    let mut from = 0;
    while let Some(pos) = haystack[from..].find(code) {
        let start = from + pos;
        let end = start + code.len();
        let before_ok = start == 0 || !bytes[start - 1].is_ascii_alphanumeric();
        let after_ok = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if before_ok && after_ok {
            return Some(start);
        }
        from = start + 1;
    }
    None
}

/// One entity cut out of a bundled unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub identifier: String,
    pub text: String,
}

/// How the remaining stages should treat a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundlePlan {
    Single { discarded: Vec<String> },
    Split {
        segments: Vec<Segment>,
        discarded: Vec<String>,
    },
}

impl BundlePlan {
    pub fn discarded(&self) -> &[String] {
        match self {
            BundlePlan::Single { discarded } | BundlePlan::Split { discarded, .. } => discarded,
        }
    }
}

/// Detect a multi-entity post and split it on verified identifiers.
///
/// Fewer than two verified identifiers falls back to single-unit handling.
pub fn plan_bundle(text: &str) -> BundlePlan {
    let candidates = candidate_identifiers(text);
    if candidates.len() < 2 {
        return BundlePlan::Single {
            discarded: Vec::new(),
        };
    }

    let (verified, discarded) = verify_all(text, &candidates);
    if verified.len() < 2 {
        tracing::debug!(
            candidates = candidates.len(),
            verified = verified.len(),
            "Bundle suspected but too few verified identifiers, handling as single unit"
        );
        return BundlePlan::Single { discarded };
    }

    let mut starts: Vec<(usize, String)> = verified
        .into_iter()
        .filter_map(|code| find_verbatim(text, &code).map(|pos| (line_start(text, pos), code)))
        .collect();
    starts.sort_by_key(|(pos, _)| *pos);
    starts.dedup_by_key(|(pos, _)| *pos);

    if starts.len() < 2 {
        return BundlePlan::Single { discarded };
    }

    let segments = starts
        .iter()
        .enumerate()
        .map(|(i, (start, code))| {
            let end = starts.get(i + 1).map_or(text.len(), |(next, _)| *next);
            Segment {
                identifier: code.clone(),
                text: text[*start..end].trim().to_string(),
            }
        })
        .collect();

    BundlePlan::Split {
        segments,
        discarded,
    }
}

fn line_start(text: &str, pos: usize) -> usize {
    text[..pos].rfind('\n').map_or(0, |nl| nl + 1)
}
