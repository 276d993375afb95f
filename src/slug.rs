//! Prompt slugification for image filenames.

use unicode_normalization::UnicodeNormalization;

/// Convert a prompt into a filesystem-safe slug.
///
/// NFKD-normalizes and drops everything outside ASCII, removes characters
/// that are not word characters, whitespace or hyphens, then collapses
/// whitespace and hyphen runs into single hyphens. Output is lowercase;
/// applying `slugify` twice yields the same result as once.
pub fn slugify(value: &str) -> String {
    let ascii: String = value
        .nfkd()
        .filter(char::is_ascii)
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();
    ascii
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
