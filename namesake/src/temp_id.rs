//! Deterministic temporary company ids.
//!
//! When no canonical id can be found for a row, the resolver assigns a stable
//! placeholder of the form `IN_<16 Base32 chars>`: a keyed HMAC-SHA1 over the
//! normalised customer name, truncated to 10 bytes and Base32-encoded. The
//! same post-normalisation name always yields the same id, across processes
//! and runs, which is what makes idempotent re-loads and later backfills
//! possible. Consumers distinguish temp ids from canonical (numeric) ids by
//! the `IN` prefix alone.

use base32::Alphabet;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::normalize::normalize_company_name;

/// Prefix shared by every temporary id.
pub const TEMP_ID_PREFIX: &str = "IN_";

/// Substitute message when a name normalises to nothing.
const EMPTY_NAME_SENTINEL: &str = "__empty__";

/// Placeholder strings that mean "no customer name" in source spreadsheets.
/// They must never be hashed into a shared temp id.
pub const EMPTY_PLACEHOLDERS: [&str; 2] = ["0", "空白"];

/// Generate the temporary id for `customer_name` under `salt`.
///
/// The name is normalised first, so all raw variants of one customer collide
/// on the same id by design. An empty normalised name hashes the
/// `__empty__` sentinel instead; callers that need placeholder suppression
/// should use [`temp_id_for`].
pub fn temp_company_id(customer_name: &str, salt: &str) -> String {
    let normalized = normalize_company_name(customer_name);
    let message = if normalized.is_empty() {
        EMPTY_NAME_SENTINEL
    } else {
        normalized.as_str()
    };

    let mut mac =
        Hmac::<Sha1>::new_from_slice(salt.as_bytes()).expect("hmac accepts any key length");
    mac.update(message.as_bytes());
    let digest = mac.finalize().into_bytes();

    // 10 bytes -> exactly 16 Base32 characters, no padding.
    let encoded = base32::encode(Alphabet::Rfc4648 { padding: false }, &digest[..10]);
    format!("{TEMP_ID_PREFIX}{encoded}")
}

/// Resolver-side temp-id rule: `None`, empty, whitespace-only, and the fixed
/// placeholders yield no id at all rather than a hash of the placeholder.
pub fn temp_id_for(customer_name: Option<&str>, salt: &str) -> Option<String> {
    let name = customer_name?.trim();
    if name.is_empty() || EMPTY_PLACEHOLDERS.contains(&name) {
        return None;
    }
    Some(temp_company_id(name, salt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn ids_are_deterministic_and_well_formed() {
        let a = temp_company_id("中国平安", "test_salt");
        let b = temp_company_id("中国平安", "test_salt");
        assert_eq!(a, b);
        assert!(a.starts_with(TEMP_ID_PREFIX));
        assert_eq!(a.len(), TEMP_ID_PREFIX.len() + 16);
        // Base32 standard alphabet only.
        assert!(
            a[TEMP_ID_PREFIX.len()..]
                .chars()
                .all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c))
        );
    }

    #[test]
    fn ids_collide_exactly_when_normalised_names_collide() {
        let salt = "salt";
        assert_eq!(
            temp_company_id("  中国平安  ", salt),
            temp_company_id("中国平安-已转出", salt),
        );
        assert_ne!(
            temp_company_id("中国平安", salt),
            temp_company_id("中国人寿", salt)
        );
    }

    #[test]
    fn salt_changes_the_id() {
        assert_ne!(
            temp_company_id("中国平安", "salt_a"),
            temp_company_id("中国平安", "salt_b")
        );
    }

    #[test]
    fn empty_normalised_name_still_hashes_deterministically() {
        assert_eq!(temp_company_id("", "salt"), temp_company_id("   ", "salt"));
    }

    #[rstest]
    #[case(None)]
    #[case(Some(""))]
    #[case(Some("   "))]
    #[case(Some("0"))]
    #[case(Some("空白"))]
    fn placeholders_yield_no_id(#[case] name: Option<&str>) {
        assert_eq!(temp_id_for(name, "salt"), None);
    }

    #[test]
    fn real_names_yield_ids_through_the_placeholder_filter() {
        let id = temp_id_for(Some("测试企业A"), "salt").unwrap();
        assert_eq!(id, temp_company_id("测试企业A", "salt"));
    }
}
