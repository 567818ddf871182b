//! Track matching utilities (`matching.*`).
//!
//! Fuzzy string comparison for matching downloaded tracks against catalogue
//! metadata: Levenshtein-based similarity, duration comparison with a
//! tolerance, and a normalizer that strips release qualifiers before
//! comparing titles.

use rquickjs::function::{Func, Opt};
use rquickjs::{Ctx, Object};

/// Default duration tolerance in milliseconds.
const DEFAULT_DURATION_TOLERANCE_MS: i64 = 3000;

/// Release qualifiers stripped during normalization. Order matters: the
/// string is truncated at the first occurrence of any entry.
const RELEASE_QUALIFIERS: &[&str] = &[
    " (remastered)",
    " (remaster)",
    " - remastered",
    " - remaster",
    " (deluxe)",
    " (deluxe edition)",
    " - deluxe",
    " - deluxe edition",
    " (explicit)",
    " (clean)",
    " [explicit]",
    " [clean]",
    " (album version)",
    " (single version)",
    " (radio edit)",
    " (feat.",
    " (ft.",
    " feat.",
    " ft.",
];

/// Similarity in `[0, 1]` after trimming and lowercasing. Equal strings
/// score 1.0; one empty operand scores 0.0 (both empty score 1.0).
pub fn compare_strings(a: &str, b: &str) -> f64 {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a == b {
        return 1.0;
    }
    string_similarity(&a, &b)
}

fn string_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let distance = levenshtein(a.as_bytes(), b.as_bytes());
    let max_len = a.len().max(b.len());
    1.0 - distance as f64 / max_len as f64
}

fn levenshtein(a: &[u8], b: &[u8]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0_usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()]
}

/// Whether two durations (milliseconds) agree within the tolerance.
pub fn compare_duration(ms1: i64, ms2: i64, tolerance_ms: Option<i64>) -> bool {
    let tolerance = tolerance_ms.unwrap_or(DEFAULT_DURATION_TOLERANCE_MS);
    (ms1 - ms2).abs() <= tolerance
}

/// Normalize a title for comparison: lowercase, truncate at the first
/// release qualifier, drop characters outside `[a-z0-9 ]`, and collapse
/// whitespace.
pub fn normalize_string(input: &str) -> String {
    let mut text = input.to_lowercase();

    for qualifier in RELEASE_QUALIFIERS {
        if let Some(index) = text.find(qualifier) {
            text.truncate(index);
        }
    }

    let filtered: String = text
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == ' ')
        .collect();

    filtered.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn register(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let matching = Object::new(ctx.clone())?;

    matching.set(
        "compareStrings",
        Func::from(|a: String, b: String| -> f64 { compare_strings(&a, &b) }),
    )?;

    matching.set(
        "compareDuration",
        Func::from(|ms1: f64, ms2: f64, tolerance: Opt<f64>| -> bool {
            compare_duration(ms1 as i64, ms2 as i64, tolerance.0.map(|t| t as i64))
        }),
    )?;

    matching.set(
        "normalizeString",
        Func::from(|input: String| -> String { normalize_string(&input) }),
    )?;

    ctx.globals().set("matching", matching)?;
    Ok(())
}
