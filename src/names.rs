//! Canonical name normalisation.
//!
//! All name equality, prefix and substring checks in the pipeline run over
//! this form: lowercase, NFD-decomposed with combining marks stripped,
//! non-alphanumeric characters removed, whitespace collapsed.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Normalise a display name to its canonical matching form.
pub fn normalize_name(name: &str) -> String {
    name.nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_accents() {
        assert_eq!(normalize_name("José García"), "jose garcia");
        assert_eq!(normalize_name("Åsa Öberg"), "asa oberg");
    }

    #[test]
    fn test_lowercases_and_collapses_whitespace() {
        assert_eq!(normalize_name("  JANE   DOE  "), "jane doe");
    }

    #[test]
    fn test_strips_punctuation() {
        assert_eq!(normalize_name("O'Brien, Patrick"), "o brien patrick");
        assert_eq!(normalize_name("Anne-Marie Smith"), "anne marie smith");
    }

    #[test]
    fn test_idempotent() {
        for name in ["José García", "O'Brien, Patrick", "Åsa  Öberg", "x"] {
            let once = normalize_name(name);
            assert_eq!(normalize_name(&once), once);
        }
    }

    #[test]
    fn test_empty() {
        assert_eq!(normalize_name(""), "");
        assert_eq!(normalize_name("!!!"), "");
    }
}
