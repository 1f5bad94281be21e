//! Close/reopen keyword detection.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::StatusSignal;

static REOPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(re-?opened|re-?open|still available|available again)\b").unwrap()
});

static CLOSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(taken|closed|filled|no longer available)\b").unwrap()
});

/// Reopen wins when both appear ("reopened, previous tutor taken").
pub fn detect(text: &str) -> Option<StatusSignal> {
    if REOPEN.is_match(text) {
        Some(StatusSignal::Reopen)
    } else if CLOSE.is_match(text) {
        Some(StatusSignal::Close)
    } else {
        None
    }
}
