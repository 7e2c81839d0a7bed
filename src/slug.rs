//! Filesystem-safe identifiers for output file names.

use unicode_normalization::UnicodeNormalization;

/// Lowercase ASCII slug made of word characters separated by single hyphens.
///
/// Diacritics are folded away (`Açaí` becomes `acai`), punctuation is dropped
/// and runs of whitespace or hyphens collapse into one hyphen. The result never
/// starts or ends with a hyphen and may be empty.
pub fn ascii_slug(value: &str) -> String {
    let folded: String = value
        .nfkd()
        .filter(char::is_ascii)
        .collect::<String>()
        .to_ascii_lowercase();

    let mut slug = String::with_capacity(folded.len());
    let mut pending_separator = false;
    for ch in folded.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            if pending_separator && !slug.is_empty() {
                slug.push('-');
            }
            pending_separator = false;
            slug.push(ch);
        } else if ch.is_ascii_whitespace() || ch == '-' {
            pending_separator = true;
        }
    }
    slug
}
