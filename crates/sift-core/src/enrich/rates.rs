//! Tagged hourly-rate extraction.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::RateRange;

/// Bounds outside which a number is not an hourly rate.
const MIN_RATE: f64 = 5.0;
const MAX_RATE: f64 = 500.0;

/// `$40-50/hr`, `S$40 to $55 per hour`, `$45 - $60`.
static RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:S?\$)\s*(\d{1,3}(?:\.\d{1,2})?)\s*(?:-|–|~|to)\s*(?:S?\$)?\s*(\d{1,3}(?:\.\d{1,2})?)",
    )
    .unwrap()
});

/// `$45/hr`, `45 per hour`, `S$45/h`.
static SINGLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:S?\$\s*(\d{1,3}(?:\.\d{1,2})?)|(\d{1,3}(?:\.\d{1,2})?)\s*(?:sgd|dollars?))\s*(?:/\s*|per\s+|an?\s+)?(?:h\b|hr|hrs|hour)?",
    )
    .unwrap()
});

fn plausible(value: f64) -> bool {
    (MIN_RATE..=MAX_RATE).contains(&value)
}

/// First plausible hourly rate in the text. Ranges win over single values.
pub fn parse(text: &str) -> Option<RateRange> {
    for caps in RANGE.captures_iter(text) {
        let (Ok(a), Ok(b)) = (caps[1].parse::<f64>(), caps[2].parse::<f64>()) else {
            continue;
        };
        if plausible(a) && plausible(b) {
            return Some(RateRange::new(a, b));
        }
    }

    for caps in SINGLE.captures_iter(text) {
        let Some(value) = caps.get(1).or_else(|| caps.get(2)) else {
            continue;
        };
        let Ok(v) = value.as_str().parse::<f64>() else {
            continue;
        };
        if plausible(v) {
            return Some(RateRange::new(v, v));
        }
    }
    None
}
