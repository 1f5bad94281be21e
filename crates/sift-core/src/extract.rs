//! Prompt, few-shot examples and parsing for the guarded extraction call.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::{ParsedOutput, SignalBundle, StatusSignal};
use crate::prefilter::verify_identifier;

pub const DEFAULT_PROMPT: &str = "You extract tutoring assignments from channel posts. \
Return ONLY a JSON object with the keys: assignment_code, title, description, location, \
postal_code, rate, schedule, subjects (array of strings), levels (array of strings), status. \
Use null for anything the post does not state. Never invent an assignment_code: copy it exactly \
as written in the post or use null. status is \"open\", \"closed\" or null.";

/// One few-shot pair sent alongside the prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionExample {
    pub input: String,
    pub output: serde_json::Value,
}

/// Load few-shot examples from a JSON array file.
pub fn load_examples(path: &Path) -> Result<Vec<ExtractionExample>, AppError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AppError::ConfigError(format!(
            "Failed to read examples file {}: {e}",
            path.display()
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        AppError::ConfigError(format!(
            "Invalid JSON in examples file {}: {e}",
            path.display()
        ))
    })
}

/// JSON Schema the service's response must satisfy.
pub fn response_schema() -> serde_json::Value {
    let nullable_string = serde_json::json!({"type": ["string", "null"]});
    serde_json::json!({
        "type": "object",
        "required": ["subjects", "levels"],
        "properties": {
            "assignment_code": nullable_string,
            "title": nullable_string,
            "description": nullable_string,
            "location": nullable_string,
            "postal_code": nullable_string,
            "rate": nullable_string,
            "schedule": nullable_string,
            "subjects": {"type": "array", "items": {"type": "string"}},
            "levels": {"type": "array", "items": {"type": "string"}},
            "status": {"type": ["string", "null"], "enum": ["open", "closed", null]}
        }
    })
}

/// Lenient view of the response; structural problems are reported by validation.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Response {
    assignment_code: Option<String>,
    title: Option<String>,
    description: Option<String>,
    location: Option<String>,
    postal_code: Option<String>,
    rate: Option<String>,
    schedule: Option<String>,
    #[serde(deserialize_with = "lenient_strings")]
    subjects: Vec<String>,
    #[serde(deserialize_with = "lenient_strings")]
    levels: Vec<String>,
    status: Option<String>,
}

fn lenient_strings<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        serde_json::Value::String(s) => s.split(',').map(|p| p.trim().to_string()).collect(),
        _ => Vec::new(),
    })
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Result of interpreting one response.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub parsed: ParsedOutput,
    /// Codes the service proposed that do not occur in the text.
    pub discarded_identifiers: Vec<String>,
}

/// Interpret a service response for `text`.
///
/// `forced_key` (a verified identifier from bundle splitting) always wins
/// over the service's code; the service's code is kept only when it occurs
/// verbatim in `text`.
pub fn parse_response(
    value: &serde_json::Value,
    text: &str,
    forced_key: Option<&str>,
) -> Result<Extracted, AppError> {
    if !value.is_object() {
        return Err(AppError::ValidationError(vec![format!(
            "extraction output is not an object: {value}"
        )]));
    }
    let response: Response = serde_json::from_value(value.clone())?;

    let mut discarded_identifiers = Vec::new();
    let proposed = clean(response.assignment_code).and_then(|code| {
        verify_identifier(&code, text)
            .inspect_err(|e| {
                tracing::warn!(candidate = %e.candidate, "Discarding unverified identifier");
                discarded_identifiers.push(e.candidate.clone());
            })
            .ok()
    });
    let natural_key = forced_key.map(str::to_string).or(proposed);

    let status_signal = match clean(response.status).as_deref() {
        Some("closed") => Some(StatusSignal::Close),
        _ => None,
    };

    let parsed = ParsedOutput {
        natural_key,
        title: clean(response.title),
        description: clean(response.description),
        location_text: clean(response.location),
        rate_text: clean(response.rate),
        schedule_text: clean(response.schedule),
        signals: SignalBundle {
            subjects: response.subjects.into_iter().collect::<BTreeSet<_>>(),
            levels: response.levels.into_iter().collect::<BTreeSet<_>>(),
            postal_code: clean(response.postal_code),
            ..Default::default()
        },
        status_signal,
        parse_quality: 0.0,
    };

    Ok(Extracted {
        parsed,
        discarded_identifiers,
    })
}
