//! Closest-key recovery: normalize + Levenshtein snap of a mis-generated key
//! to the nearest schema key.

use once_cell::sync::Lazy;
use regex::Regex;

/// Matches the separator characters stripped during normalization. Compiled
/// once and frozen behind a `Lazy` rather than rebuilt on every call.
static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[_\-]+").expect("static regex is valid"));

/// Lowercase, strip `_`/`-`, and trim surrounding whitespace.
#[must_use]
pub fn normalize(s: &str) -> String {
    SEPARATORS.replace_all(s.trim(), "").to_lowercase()
}

/// Standard dynamic-programming edit distance (insertion, deletion,
/// substitution = 1). Symmetric; zero iff the inputs are equal.
#[must_use]
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (m, n) = (a.len(), b.len());

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Snap a partial (possibly mis-generated) key to the nearest candidate.
///
/// Priority order:
/// 1. Exact normalized match.
/// 2. Bidirectional prefix match (either side), first such candidate wins.
/// 3. Minimum Levenshtein distance over the normalized forms, ties broken by
///    iteration order, only accepted if the distance is `<= max_distance`.
/// 4. Otherwise `None` — the caller falls back to the raw buffer.
#[must_use]
pub fn snap(partial: &str, candidates: &[String], max_distance: usize) -> Option<String> {
    let needle = normalize(partial);

    if let Some(exact) = candidates.iter().find(|c| normalize(c) == needle) {
        return Some(exact.clone());
    }

    if let Some(prefix) = candidates.iter().find(|c| {
        let hay = normalize(c);
        hay.starts_with(&needle) || needle.starts_with(&hay)
    }) {
        return Some(prefix.clone());
    }

    let mut best: Option<(usize, &String)> = None;
    for candidate in candidates {
        let dist = levenshtein(&needle, &normalize(candidate));
        if best.as_ref().is_none_or(|(best_dist, _)| dist < *best_dist) {
            best = Some((dist, candidate));
        }
    }

    best.filter(|(dist, _)| *dist <= max_distance)
        .map(|(_, candidate)| candidate.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_case_underscores_and_whitespace() {
        assert_eq!(normalize("  First_Name "), "firstname");
        assert_eq!(normalize("first-name"), "firstname");
    }

    #[test]
    fn levenshtein_zero_for_identical_normalized_strings() {
        assert_eq!(levenshtein("abc", "abc"), 0);
    }

    #[test]
    fn levenshtein_is_symmetric() {
        assert_eq!(levenshtein("kitten", "sitting"), levenshtein("sitting", "kitten"));
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }

    #[test]
    fn snap_is_idempotent_on_exact_normalized_key() {
        let candidates = vec!["first".to_string(), "second".to_string()];
        assert_eq!(snap("first", &candidates, 2).as_deref(), Some("first"));
        assert_eq!(snap("First", &candidates, 2).as_deref(), Some("first"));
    }

    #[test]
    fn snap_falls_back_to_levenshtein_within_threshold() {
        let candidates = vec!["first".to_string(), "second".to_string()];
        assert_eq!(snap("firts", &candidates, 2).as_deref(), Some("first"));
    }

    #[test]
    fn snap_returns_none_beyond_threshold() {
        let candidates = vec!["first".to_string(), "second".to_string()];
        assert_eq!(snap("xyzxyz", &candidates, 2), None);
    }

    #[test]
    fn snap_returns_none_with_no_candidates() {
        let candidates: Vec<String> = vec![];
        assert_eq!(snap("anything", &candidates, 2), None);
    }

    #[test]
    fn snap_prefers_prefix_match_over_distant_exact_miss() {
        let candidates = vec!["firstName".to_string(), "other".to_string()];
        assert_eq!(snap("first", &candidates, 2).as_deref(), Some("firstName"));
    }
}
