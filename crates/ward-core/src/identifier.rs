use caseless::Caseless;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Folds a loosely typed recipient or sender name into its comparison key.
///
/// The key is case-folded, decomposed with diacritics stripped, and has all
/// whitespace removed, so `"Réa  Nord"` and `"reanord"` compare equal.
pub fn normalize_identifier(raw: &str) -> String {
    raw.chars()
        .default_case_fold()
        .nfd()
        .filter(|ch| !is_combining_mark(*ch))
        .filter(|ch| !ch.is_whitespace())
        .collect()
}

/// Returns true when both identifiers normalize to the same non-empty key.
pub fn identifiers_match(left: &str, right: &str) -> bool {
    let left = normalize_identifier(left);
    !left.is_empty() && left == normalize_identifier(right)
}
