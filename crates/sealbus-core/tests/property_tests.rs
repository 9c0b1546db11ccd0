//! Property-based tests for the group cipher
//!
//! Verifies round-trip, tamper detection and cross-group isolation for
//! arbitrary plaintexts.

use proptest::prelude::*;
use sealbus_core::crypto::{GroupCipher, GroupKey, NONCE_SIZE, TAG_SIZE};
use sealbus_core::NodeError;

// ============================================================================
// Strategy Generators
// ============================================================================

fn key_strategy() -> impl Strategy<Value = GroupKey> {
    any::<[u8; 32]>().prop_map(GroupKey::from)
}

fn plaintext_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..2048)
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_roundtrip(key in key_strategy(), plaintext in plaintext_strategy()) {
        let cipher = GroupCipher::new(&key);
        let blob = cipher.encrypt(&plaintext).unwrap();
        prop_assert_eq!(blob.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);
        prop_assert_eq!(cipher.decrypt(&blob).unwrap(), plaintext);
    }

    #[test]
    fn prop_base64_roundtrip(key in key_strategy(), plaintext in plaintext_strategy()) {
        let cipher = GroupCipher::new(&key);
        let blob = cipher.encrypt_to_base64(&plaintext).unwrap();
        prop_assert_eq!(cipher.decrypt_base64(&blob).unwrap(), plaintext);
    }

    #[test]
    fn prop_any_bit_flip_is_rejected(
        key in key_strategy(),
        plaintext in plaintext_strategy(),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let cipher = GroupCipher::new(&key);
        let mut blob = cipher.encrypt(&plaintext).unwrap();
        let i = position.index(blob.len());
        blob[i] ^= 1 << bit;
        prop_assert!(matches!(cipher.decrypt(&blob), Err(NodeError::CryptoAuth(_))));
    }

    #[test]
    fn prop_other_group_key_is_rejected(
        key in key_strategy(),
        other in key_strategy(),
        plaintext in plaintext_strategy(),
    ) {
        prop_assume!(key != other);
        let blob = GroupCipher::new(&key).encrypt(&plaintext).unwrap();
        prop_assert!(GroupCipher::new(&other).decrypt(&blob).is_err());
    }

    #[test]
    fn prop_truncated_blob_is_rejected(
        key in key_strategy(),
        plaintext in plaintext_strategy(),
        cut in 1usize..64,
    ) {
        let cipher = GroupCipher::new(&key);
        let blob = cipher.encrypt(&plaintext).unwrap();
        let keep = blob.len().saturating_sub(cut);
        prop_assert!(cipher.decrypt(&blob[..keep]).is_err());
    }

    #[test]
    fn prop_nonces_never_repeat(key in key_strategy(), plaintext in plaintext_strategy()) {
        let cipher = GroupCipher::new(&key);
        let a = cipher.encrypt(&plaintext).unwrap();
        let b = cipher.encrypt(&plaintext).unwrap();
        prop_assert_ne!(&a[..NONCE_SIZE], &b[..NONCE_SIZE]);
    }
}
