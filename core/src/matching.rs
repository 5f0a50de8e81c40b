//! Fuzzy text matching used for issue deduplication.

use similar::TextDiff;

/// Similarity ratio above which two snippets or descriptions are
/// considered the same issue.
pub const SIMILARITY_THRESHOLD: f64 = 0.8;

/// Collapse runs of whitespace into single spaces and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized similarity between two strings, 0.0 (disjoint) to 1.0
/// (identical).
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    f64::from(TextDiff::from_chars(a, b).ratio())
}

/// Whether two already-normalized texts are equal or similar beyond the
/// dedup threshold. Empty texts never fuzzy-match anything.
pub(crate) fn texts_match(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || similarity_ratio(a, b) >= SIMILARITY_THRESHOLD
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn normalizes_whitespace() {
        assert_eq!(normalize_whitespace("  a\t b\n\nc  "), "a b c");
        assert_eq!(normalize_whitespace(""), "");
    }

    #[test]
    fn identical_strings_have_ratio_one() {
        assert_eq!(similarity_ratio("let x = 1;", "let x = 1;"), 1.0);
    }

    #[test]
    fn near_identical_strings_pass_threshold() {
        let a = "missing null check before dereferencing pointer";
        let b = "missing null check before dereferencing the pointer";
        assert!(similarity_ratio(a, b) >= SIMILARITY_THRESHOLD);
    }

    #[test]
    fn unrelated_strings_fail_threshold() {
        let a = "unchecked arithmetic overflow in loop counter";
        let b = "file handle leaked on early return";
        assert!(similarity_ratio(a, b) < SIMILARITY_THRESHOLD);
    }

    #[test]
    fn empty_texts_never_match() {
        assert!(!texts_match("", ""));
        assert!(!texts_match("x", ""));
    }
}
