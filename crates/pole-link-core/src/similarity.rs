//! Name and address similarity used by candidate tagging, scoring and conflict detection.

const STREET_TYPE_WORDS: [&str; 6] = ["street", "st", "road", "rd", "avenue", "ave"];

fn normalized_terms(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(str::to_lowercase)
}

/// Case-folded, punctuation-stripped, whitespace-collapsed form of a person's name.
#[must_use]
pub fn normalize_name(value: &str) -> String {
    normalized_terms(value).collect::<Vec<_>>().join(" ")
}

/// Address form with punctuation and street-type words removed.
#[must_use]
pub fn normalize_address(value: &str) -> String {
    normalized_terms(value)
        .filter(|term| !STREET_TYPE_WORDS.contains(&term.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Jaro-Winkler similarity of two agent names after normalization.
///
/// Returns `None` when either side has no usable characters, so a missing name is never
/// mistaken for a mismatch.
#[must_use]
pub fn agent_name_similarity(lhs: &str, rhs: &str) -> Option<f64> {
    let lhs = normalize_name(lhs);
    let rhs = normalize_name(rhs);
    if lhs.is_empty() || rhs.is_empty() {
        return None;
    }
    if lhs == rhs {
        return Some(1.0);
    }
    Some(strsim::jaro_winkler(&lhs, &rhs).clamp(0.0, 1.0))
}

/// Normalized Levenshtein similarity of two addresses after normalization.
#[must_use]
pub fn address_similarity(lhs: &str, rhs: &str) -> Option<f64> {
    let lhs = normalize_address(lhs);
    let rhs = normalize_address(rhs);
    if lhs.is_empty() || rhs.is_empty() {
        return None;
    }
    if lhs == rhs {
        return Some(1.0);
    }
    Some(strsim::normalized_levenshtein(&lhs, &rhs).clamp(0.0, 1.0))
}
