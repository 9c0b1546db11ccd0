//! Node identity
//!
//! Every node owns one long-term secp256k1 signing keypair, the same curve
//! and encoding the ledger uses for transaction signers:
//!
//! - public keys travel as 33-byte compressed SEC1 points, hex encoded
//! - signatures are 64-byte `r || s` ECDSA signatures over SHA-256
//!
//! The identity authenticates Diffie–Hellman handshakes (see
//! [`crate::handshake`]) and is owned exclusively by the
//! [`SecretStore`](crate::storage::SecretStore).
//!
//! ## Example
//!
//! ```rust
//! use sealbus_core::identity::{Identity, IdentityPublicKey};
//!
//! let identity = Identity::generate();
//! let public_hex = identity.public_key().to_hex();
//!
//! let signature = identity.sign(b"alice|AAAA");
//! let public_key = IdentityPublicKey::from_hex(&public_hex).unwrap();
//! assert!(public_key.verify(b"alice|AAAA", &signature));
//! ```

mod keypair;

pub use keypair::{Identity, IdentityPublicKey, IdentitySignature, SIGNATURE_SIZE};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_identity_workflow() {
        let identity = Identity::generate();
        let public_key = identity.public_key();

        let message = b"Integration test message";
        let signature = identity.sign(message);
        assert!(public_key.verify(message, &signature));

        // Hex roundtrip of the public key
        let recovered = IdentityPublicKey::from_hex(&public_key.to_hex()).unwrap();
        assert!(recovered.verify(message, &signature));
        assert_eq!(recovered, public_key);
    }

    #[test]
    fn test_keypair_persistence() {
        let identity = Identity::generate();
        let original_signature = identity.sign(b"Persistence test");

        let recovered = Identity::from_hex(&identity.to_hex()).unwrap();
        assert_eq!(recovered.public_key(), identity.public_key());
        assert!(recovered
            .public_key()
            .verify(b"Persistence test", &original_signature));
    }

    #[test]
    fn test_cross_verification() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        let alice_signature = alice.sign(b"Message from Alice to Bob");

        assert!(alice
            .public_key()
            .verify(b"Message from Alice to Bob", &alice_signature));
        assert!(!bob
            .public_key()
            .verify(b"Message from Alice to Bob", &alice_signature));
    }
}
