//! Subject and level categorization from free text.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

/// Canonical subject and the alias patterns that map to it.
const SUBJECTS: &[(&str, &[&str])] = &[
    ("Math", &[r"math(?:s|ematics)?", r"[ae][ .\-]?math", r"h[12] math"]),
    ("English", &[r"english", r"\bEL\b"]),
    ("Science", &[r"science", r"sci\b"]),
    ("Physics", &[r"physics", r"phy\b"]),
    ("Chemistry", &[r"chemistry", r"chem\b"]),
    ("Biology", &[r"biology", r"bio\b"]),
    ("Chinese", &[r"chinese", r"mandarin", r"\bCL\b", r"\bhcl\b"]),
    ("Malay", &[r"malay", r"\bML\b"]),
    ("Tamil", &[r"tamil", r"\bTL\b"]),
    ("Economics", &[r"econ(?:omics|s)?"]),
    ("Geography", &[r"geography", r"geog?\b"]),
    ("History", &[r"history"]),
    ("Literature", &[r"literature", r"\blit\b"]),
    ("Accounting", &[r"accounting", r"\bpoa\b"]),
    ("Computing", &[r"computing", r"programming", r"coding"]),
    ("General Paper", &[r"general paper", r"\bGP\b"]),
];

/// Canonical level and the alias patterns that map to it.
const LEVELS: &[(&str, &[&str])] = &[
    ("Pre-School", &[r"pre-?school", r"\bk[12]\b", r"kindergarten", r"nursery"]),
    ("Primary", &[r"primary", r"\bp[1-6]\b", r"\bpri\s?[1-6]\b", r"\bpsle\b"]),
    ("Secondary", &[r"secondary", r"\bsec\s?[1-5]\b", r"\bo[ \-]?levels?\b", r"\bn[ \-]?levels?\b"]),
    ("JC", &[r"\bjc\s?[12]?\b", r"junior college", r"\ba[ \-]?levels?\b", r"\bh[12]\b"]),
    ("IB", &[r"\bib\b", r"\bmyp\b", r"\bibdp\b"]),
    ("IGCSE", &[r"igcse"]),
    ("Polytechnic", &[r"poly(?:technic)?\b"]),
    ("University", &[r"university", r"\buni\b", r"undergrad"]),
    ("Adult", &[r"\badult\b", r"working professional"]),
];

struct Category {
    name: &'static str,
    pattern: Regex,
}

fn compile(table: &[(&'static str, &[&str])]) -> Vec<Category> {
    table
        .iter()
        .map(|(name, aliases)| {
            // Two-letter acronyms are matched case-sensitively.
            let alternation = aliases
                .iter()
                .map(|a| {
                    if a.chars().any(|c| c.is_ascii_uppercase()) {
                        format!("(?-i:{a})")
                    } else {
                        format!(r"\b{a}")
                    }
                })
                .collect::<Vec<_>>()
                .join("|");
            Category {
                name,
                pattern: Regex::new(&format!("(?i){alternation}")).unwrap(),
            }
        })
        .collect()
}

static SUBJECT_PATTERNS: LazyLock<Vec<Category>> = LazyLock::new(|| compile(SUBJECTS));
static LEVEL_PATTERNS: LazyLock<Vec<Category>> = LazyLock::new(|| compile(LEVELS));

fn categorize(patterns: &[Category], text: &str) -> BTreeSet<String> {
    patterns
        .iter()
        .filter(|c| c.pattern.is_match(text))
        .map(|c| c.name.to_string())
        .collect()
}

pub fn subjects(text: &str) -> BTreeSet<String> {
    categorize(&SUBJECT_PATTERNS, text)
}

pub fn levels(text: &str) -> BTreeSet<String> {
    categorize(&LEVEL_PATTERNS, text)
}

/// Map free-form labels (e.g. from the extraction service) onto the
/// canonical vocabulary. Unknown labels are kept, trimmed.
pub fn canonicalize<'a>(
    labels: impl IntoIterator<Item = &'a String>,
    categorize: fn(&str) -> BTreeSet<String>,
) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for label in labels {
        let label = label.trim();
        if label.is_empty() {
            continue;
        }
        let known = categorize(label);
        if known.is_empty() {
            out.insert(label.to_string());
        } else {
            out.extend(known);
        }
    }
    out
}
