// 📏 Similarity Scorer - name similarity in [0, 1]
//
// Exact match after normalization scores 1.0. Everything else is the
// average of Jaro-Winkler (good for typos near the start of a string) and
// normalized Levenshtein (general edit distance). Inputs are expected to
// already be matching keys from `normalize::matching_key`.

/// Engine default for "these two names denote the same entity".
/// Tunable per reconciler; not load-bearing for correctness.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.85;

/// Score the similarity of two normalized strings.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let jw = strsim::jaro_winkler(a, b);
    let lev = strsim::normalized_levenshtein(a, b);

    ((jw + lev) / 2.0).clamp(0.0, 1.0)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_is_one() {
        assert_eq!(similarity("screening", "screening"), 1.0);
    }

    #[test]
    fn test_empty_vs_nonempty_is_zero() {
        assert_eq!(similarity("", "screening"), 0.0);
        assert_eq!(similarity("screening", ""), 0.0);
    }

    #[test]
    fn test_near_match_above_default_threshold() {
        // Single dropped character
        assert!(similarity("screening", "screning") >= DEFAULT_MATCH_THRESHOLD);
        assert!(similarity("follow up visit", "followup visit") >= DEFAULT_MATCH_THRESHOLD);
    }

    #[test]
    fn test_distinct_names_below_threshold() {
        assert!(similarity("screening", "treatment") < DEFAULT_MATCH_THRESHOLD);
        assert!(similarity("day 1", "week 12") < DEFAULT_MATCH_THRESHOLD);
    }

    #[test]
    fn test_symmetry() {
        let ab = similarity("baseline", "base line");
        let ba = similarity("base line", "baseline");
        assert!((ab - ba).abs() < 1e-9);
    }

    #[test]
    fn test_score_in_unit_interval() {
        for (a, b) in [("a", "b"), ("screening", "scr"), ("x", "xyzzy")] {
            let s = similarity(a, b);
            assert!((0.0..=1.0).contains(&s), "{} vs {} scored {}", a, b, s);
        }
    }
}
