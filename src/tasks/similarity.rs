//! Word-set similarity over task descriptions.

use std::collections::HashSet;

/// Jaccard similarity between the lowercased word sets of two strings.
///
/// Returns 1.0 when both are empty and 0.0 when only one is.
#[must_use]
pub fn word_jaccard(a: &str, b: &str) -> f64 {
    let set_a: HashSet<String> = a.to_lowercase().split_whitespace().map(String::from).collect();
    let set_b: HashSet<String> = b.to_lowercase().split_whitespace().map(String::from).collect();

    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}
