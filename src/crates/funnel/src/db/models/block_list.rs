//! Block-list model

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An address that must never receive campaign messages
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BlockListEntry {
    pub tenant_id: String,
    pub address: String,
    pub reason: String,
    pub created_at: String,
}

/// Keep only the digits of an address.
///
/// Addresses arrive as `+55 (11) 9999-0000`, `5511999990000` or
/// `whatsapp:+5511999990000` depending on the source.
pub fn normalize_address(address: &str) -> String {
    address.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Minimum number of digits two addresses must share to match by suffix
pub const MIN_SUFFIX_DIGITS: usize = 8;

/// Suffix match between two addresses after normalization.
///
/// Equal normalized values always match. Otherwise the shorter one must be a
/// suffix of the longer one and carry at least [`MIN_SUFFIX_DIGITS`] digits,
/// which tolerates a missing country or area code.
pub fn addresses_match(a: &str, b: &str) -> bool {
    let a = normalize_address(a);
    let b = normalize_address(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    let (short, long) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    short.len() >= MIN_SUFFIX_DIGITS && long.ends_with(short.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_address() {
        assert_eq!(normalize_address("+55 (11) 99999-0000"), "5511999990000");
        assert_eq!(normalize_address("whatsapp:+15550001111"), "15550001111");
    }

    #[test]
    fn test_suffix_match_tolerates_country_code() {
        assert!(addresses_match("+55 11 99999-0000", "11999990000"));
        assert!(addresses_match("11999990000", "5511999990000"));
    }

    #[test]
    fn test_short_suffix_does_not_match() {
        assert!(!addresses_match("0000", "5511999990000"));
        assert!(!addresses_match("", "5511999990000"));
    }

    #[test]
    fn test_different_numbers_do_not_match() {
        assert!(!addresses_match("5511999990000", "5511999990001"));
    }
}
