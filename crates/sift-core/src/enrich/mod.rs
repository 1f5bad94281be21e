//! Deterministic enrichment layered over the guarded extraction.
//!
//! Every sub-extractor reads the same raw text. Where a sub-extractor
//! produces a value it replaces the extraction service's equivalent; the
//! service's value is only kept (normalized) when the text yields nothing.

pub mod availability;
pub mod location;
pub mod rates;
pub mod status;
pub mod taxonomy;

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::models::ParsedOutput;

static ONLINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(online|zoom|virtual|remote)\b").unwrap());
static GROUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bgroup (?:tuition|class|lessons?)\b").unwrap());

fn tags(text: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    if ONLINE.is_match(text) {
        out.insert("online".to_string());
    }
    if GROUP.is_match(text) {
        out.insert("group".to_string());
    }
    out
}

fn has_text(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|s| !s.trim().is_empty())
}

/// Fraction of the facets a complete record carries.
pub fn parse_quality(parsed: &ParsedOutput) -> f32 {
    let facets = [
        has_text(&parsed.title) || has_text(&parsed.description),
        !parsed.signals.subjects.is_empty(),
        !parsed.signals.levels.is_empty(),
        parsed.signals.postal_code.is_some() || has_text(&parsed.location_text),
        parsed.signals.rate.is_some() || has_text(&parsed.rate_text),
        !parsed.signals.availability.is_empty() || has_text(&parsed.schedule_text),
    ];
    let present = facets.iter().filter(|f| **f).count();
    present as f32 / facets.len() as f32
}

/// Layer deterministic signals onto `parsed` and recompute its quality.
pub fn enrich(text: &str, mut parsed: ParsedOutput) -> ParsedOutput {
    let signals = &mut parsed.signals;

    let subjects = taxonomy::subjects(text);
    signals.subjects = if subjects.is_empty() {
        taxonomy::canonicalize(&signals.subjects, taxonomy::subjects)
    } else {
        subjects
    };

    let levels = taxonomy::levels(text);
    signals.levels = if levels.is_empty() {
        taxonomy::canonicalize(&signals.levels, taxonomy::levels)
    } else {
        levels
    };

    signals.postal_code = location::postal_code(text).or_else(|| {
        signals
            .postal_code
            .take()
            .filter(|code| location::is_valid_postal_code(code))
    });
    signals.coords = signals.postal_code.as_deref().and_then(location::resolve);

    signals.rate = rates::parse(text)
        .or_else(|| parsed.rate_text.as_deref().and_then(rates::parse))
        .or(signals.rate);

    let availability = availability::parse(text);
    signals.availability = if availability.is_empty() {
        parsed
            .schedule_text
            .as_deref()
            .map(availability::parse)
            .unwrap_or_default()
    } else {
        availability
    };

    signals.tags.extend(tags(text));

    parsed.status_signal = status::detect(text).or(parsed.status_signal);
    parsed.parse_quality = parse_quality(&parsed);
    parsed
}
