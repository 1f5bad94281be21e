use std::path::Path;

use anyhow::{Context, Result};
use sift_core::models::NewRawUnit;

/// Read raw units from a JSON array file or newline-delimited JSON.
pub fn read_units(path: &Path) -> Result<Vec<NewRawUnit>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read units file: {}", path.display()))?;
    parse_units(&content)
}

pub fn parse_units(content: &str) -> Result<Vec<NewRawUnit>> {
    if content.trim_start().starts_with('[') {
        return serde_json::from_str(content).context("Invalid JSON array of raw units");
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid raw unit on line {}", i + 1))
        })
        .collect()
}
