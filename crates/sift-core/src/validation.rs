//! Structural and semantic validation of extraction results.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::enrich::location;
use crate::error::AppError;
use crate::models::ParsedOutput;

static NATURAL_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z0-9]{3,12}$").unwrap());

const MAX_HOURLY_RATE: f64 = 500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    Off,
    ReportOnly,
    #[default]
    Enforce,
}

impl ValidationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationMode::Off => "off",
            ValidationMode::ReportOnly => "report_only",
            ValidationMode::Enforce => "enforce",
        }
    }
}

impl fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ValidationMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "off" => Ok(ValidationMode::Off),
            "report_only" | "report" => Ok(ValidationMode::ReportOnly),
            "enforce" => Ok(ValidationMode::Enforce),
            _ => Err(AppError::ConfigError(format!(
                "Unknown validation mode: {s} (expected off, report_only or enforce)"
            ))),
        }
    }
}

/// What validation found. Under `Enforce`, any error makes the job `invalid`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Response schema compiled once and shared by every unit.
///
/// A schema that fails to compile is kept as an error and reported as a
/// config error on each check.
#[derive(Clone)]
pub struct SchemaCheck {
    compiled: Result<Arc<jsonschema::Validator>, String>,
}

impl SchemaCheck {
    pub fn compile(schema: &serde_json::Value) -> Self {
        let compiled = jsonschema::validator_for(schema)
            .map(Arc::new)
            .map_err(|e| e.to_string());
        if let Err(e) = &compiled {
            tracing::error!(error = %e, "Invalid response schema");
        }
        Self { compiled }
    }

    /// One message per violation in `instance`.
    pub fn check(&self, instance: &serde_json::Value) -> Result<Vec<String>, AppError> {
        let validator = self
            .compiled
            .as_ref()
            .map_err(|e| AppError::ConfigError(format!("Invalid response schema: {e}")))?;
        Ok(validator
            .iter_errors(instance)
            .map(|e| e.to_string())
            .collect())
    }
}

impl fmt::Debug for SchemaCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaCheck")
            .field("compiled", &self.compiled.is_ok())
            .finish()
    }
}

/// Domain rules the schema cannot express.
pub fn check_semantics(parsed: &ParsedOutput, link: Option<&str>) -> Vec<String> {
    let mut errors = Vec::new();

    if parsed.signals.subjects.is_empty() {
        errors.push("no subject identified".to_string());
    }

    if parsed.title.is_none() && parsed.description.is_none() {
        errors.push("neither title nor description present".to_string());
    }

    if let Some(key) = &parsed.natural_key
        && !NATURAL_KEY.is_match(key)
    {
        errors.push(format!("malformed natural key: {key}"));
    }

    if let Some(code) = &parsed.signals.postal_code
        && !location::is_valid_postal_code(code)
    {
        errors.push(format!("invalid postal code: {code}"));
    }

    if let Some(rate) = &parsed.signals.rate
        && (rate.min <= 0.0 || rate.max > MAX_HOURLY_RATE || rate.min > rate.max)
    {
        errors.push(format!("implausible rate: {}-{}", rate.min, rate.max));
    }

    if !(0.0..=1.0).contains(&parsed.parse_quality) {
        errors.push(format!("parse quality out of range: {}", parsed.parse_quality));
    }

    if let Some(link) = link {
        match url::Url::parse(link) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => {}
            Ok(u) => errors.push(format!("unsupported link scheme: {}", u.scheme())),
            Err(e) => errors.push(format!("invalid link {link}: {e}")),
        }
    }

    errors
}

/// Structural check always; semantic checks under `mode`.
///
/// Structural violations are always errors. `ReportOnly` turns semantic
/// errors into warnings and `Off` skips them.
pub fn validate(
    mode: ValidationMode,
    schema: &SchemaCheck,
    response: &serde_json::Value,
    parsed: &ParsedOutput,
    link: Option<&str>,
) -> Result<ValidationReport, AppError> {
    let mut report = ValidationReport {
        errors: schema.check(response)?,
        warnings: Vec::new(),
    };

    match mode {
        ValidationMode::Off => {}
        ValidationMode::ReportOnly => report.warnings = check_semantics(parsed, link),
        ValidationMode::Enforce => report.errors.extend(check_semantics(parsed, link)),
    }
    Ok(report)
}
