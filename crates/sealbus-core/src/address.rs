//! Ledger address derivation
//!
//! An address is 70 lowercase hex characters: a 6-character namespace prefix
//! followed by the last 64 characters of the hex SHA-512 of some identifier.
//! The ledger's transaction processor derives addresses the same way, so this
//! must stay byte-for-byte compatible.

use sha2::{Digest, Sha512};

/// Namespace prefix of the message transaction family
pub const DEFAULT_NAMESPACE_PREFIX: &str = "2f9d35";

/// Length of a namespace prefix in hex characters
pub const NAMESPACE_PREFIX_LEN: usize = 6;

/// Length of a full address in hex characters
pub const ADDRESS_LEN: usize = 70;

/// Hex-encoded SHA-512 of the UTF-8 bytes of `input`.
pub fn hash512_hex(input: &str) -> String {
    hex::encode(Sha512::digest(input.as_bytes()))
}

/// `prefix + last64(sha512_hex(input))`
pub fn namespace_hash_address(prefix: &str, input: &str) -> String {
    let hash = hash512_hex(input);
    format!("{}{}", prefix, &hash[hash.len() - 64..])
}

/// Whether `address` has the 70-hex-character shape.
pub fn is_valid_address(address: &str) -> bool {
    address.len() == ADDRESS_LEN && address.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash512_known_value() {
        // SHA-512("abc")
        assert_eq!(
            hash512_hex("abc"),
            "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
             2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
    }

    #[test]
    fn test_address_shape() {
        let addr = namespace_hash_address(DEFAULT_NAMESPACE_PREFIX, "contract-id");
        assert_eq!(addr.len(), ADDRESS_LEN);
        assert!(addr.starts_with(DEFAULT_NAMESPACE_PREFIX));
        assert!(is_valid_address(&addr));
    }

    #[test]
    fn test_address_uses_hash_tail() {
        let addr = namespace_hash_address("abcdef", "abc");
        assert_eq!(
            &addr[NAMESPACE_PREFIX_LEN..],
            "2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f"
        );
    }

    #[test]
    fn test_address_is_deterministic() {
        assert_eq!(
            namespace_hash_address(DEFAULT_NAMESPACE_PREFIX, "x"),
            namespace_hash_address(DEFAULT_NAMESPACE_PREFIX, "x")
        );
        assert_ne!(
            namespace_hash_address(DEFAULT_NAMESPACE_PREFIX, "x"),
            namespace_hash_address(DEFAULT_NAMESPACE_PREFIX, "y")
        );
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(!is_valid_address(DEFAULT_NAMESPACE_PREFIX));
        assert!(!is_valid_address(&"z".repeat(ADDRESS_LEN)));
    }
}
