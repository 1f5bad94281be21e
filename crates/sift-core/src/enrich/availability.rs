//! Temporal availability parsing into `day:slot` tags.
//!
//! Days are `mon`..`sun`; slots are `morning`, `afternoon`, `evening`.
//! A missing side is written as `any`, e.g. `sat:any` or `any:evening`.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

pub const ANY: &str = "any";

const DAYS: &[(&str, &str)] = &[
    ("mon", r"mon(?:day)?s?"),
    ("tue", r"tue(?:s(?:day)?)?s?"),
    ("wed", r"wed(?:nesday)?s?"),
    ("thu", r"thu(?:r(?:s(?:day)?)?)?s?"),
    ("fri", r"fri(?:day)?s?"),
    ("sat", r"sat(?:urday)?s?"),
    ("sun", r"sun(?:day)?s?"),
];

const WEEKDAYS: [&str; 5] = ["mon", "tue", "wed", "thu", "fri"];
const WEEKEND: [&str; 2] = ["sat", "sun"];

static DAY_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    DAYS.iter()
        .map(|(day, pattern)| (*day, Regex::new(&format!(r"(?i)\b{pattern}\b")).unwrap()))
        .collect()
});

static WEEKDAYS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bweekdays?\b").unwrap());
static WEEKEND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bweekends?\b").unwrap());

static SLOT_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(morning|afternoon|evening|night)s?\b").unwrap());

/// Clock times such as `7pm`, `7.30pm`, `19:00`.
static CLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})(?:[:.](\d{2}))?\s*(am|pm)\b|\b([01]?\d|2[0-3]):([0-5]\d)\b")
        .unwrap()
});

fn slot_for_hour(hour: u32) -> &'static str {
    match hour {
        0..=11 => "morning",
        12..=17 => "afternoon",
        _ => "evening",
    }
}

fn days(text: &str) -> BTreeSet<&'static str> {
    let mut out: BTreeSet<&'static str> = DAY_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(day, _)| *day)
        .collect();
    if WEEKDAYS_RE.is_match(text) {
        out.extend(WEEKDAYS);
    }
    if WEEKEND_RE.is_match(text) {
        out.extend(WEEKEND);
    }
    out
}

fn slots(text: &str) -> BTreeSet<&'static str> {
    let mut out = BTreeSet::new();
    for caps in SLOT_WORDS.captures_iter(text) {
        let slot = match caps[1].to_lowercase().as_str() {
            "morning" => "morning",
            "afternoon" => "afternoon",
            _ => "evening",
        };
        out.insert(slot);
    }
    for caps in CLOCK.captures_iter(text) {
        let hour = if let Some(h) = caps.get(1) {
            let Ok(h) = h.as_str().parse::<u32>() else {
                continue;
            };
            if h == 0 || h > 12 {
                continue;
            }
            let pm = caps
                .get(3)
                .is_some_and(|m| m.as_str().eq_ignore_ascii_case("pm"));
            match (h, pm) {
                (12, false) => 0,
                (12, true) => 12,
                (h, true) => h + 12,
                (h, false) => h,
            }
        } else if let Some(h) = caps.get(4) {
            let Ok(h) = h.as_str().parse::<u32>() else {
                continue;
            };
            h
        } else {
            continue;
        };
        out.insert(slot_for_hour(hour));
    }
    out
}

/// Parse availability into `day:slot` tags (cartesian product of what was found).
pub fn parse(text: &str) -> BTreeSet<String> {
    let days = days(text);
    let slots = slots(text);
    match (days.is_empty(), slots.is_empty()) {
        (true, true) => BTreeSet::new(),
        (false, true) => days.iter().map(|d| format!("{d}:{ANY}")).collect(),
        (true, false) => slots.iter().map(|s| format!("{ANY}:{s}")).collect(),
        (false, false) => days
            .iter()
            .flat_map(|d| slots.iter().map(move |s| format!("{d}:{s}")))
            .collect(),
    }
}

fn tag_matches(a: &str, b: &str) -> bool {
    let (Some((day_a, slot_a)), Some((day_b, slot_b))) = (a.split_once(':'), b.split_once(':'))
    else {
        return false;
    };
    let day_ok = day_a == day_b || day_a == ANY || day_b == ANY;
    let slot_ok = slot_a == slot_b || slot_a == ANY || slot_b == ANY;
    day_ok && slot_ok
}

/// Whether two availability sets share at least one slot, honouring wildcards.
pub fn overlaps(a: &BTreeSet<String>, b: &BTreeSet<String>) -> bool {
    a.iter().any(|x| b.iter().any(|y| tag_matches(x, y)))
}
