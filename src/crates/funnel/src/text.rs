//! Text folding for user-authored comparisons
//!
//! Tags, trigger phrases and opt-out keywords are compared after folding so
//! "Promoção", "promocao" and " PROMOCAO " are the same value.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Lowercase, strip diacritics, trim and collapse inner whitespace
pub fn fold(input: &str) -> String {
    let stripped: String = input
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compare two strings after folding
pub fn folded_eq(a: &str, b: &str) -> bool {
    fold(a) == fold(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_strips_diacritics_and_case() {
        assert_eq!(fold("Promoção"), "promocao");
        assert_eq!(fold("  CAFÉ   com  Leite "), "cafe com leite");
    }

    #[test]
    fn test_folded_eq() {
        assert!(folded_eq("Cliente VIP", "cliente vip"));
        assert!(folded_eq("Árvore", "arvore"));
        assert!(!folded_eq("vip", "vips"));
    }
}
