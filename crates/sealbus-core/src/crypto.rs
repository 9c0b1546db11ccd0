//! Group encryption layer using AES-256-GCM
//!
//! Every group has its own 256-bit symmetric key. Each encryption draws a
//! fresh 96-bit random nonce from the system RNG, so no counter state is kept
//! and a nonce is never reused under the same key.
//!
//! # Wire Format
//!
//! Encrypted blobs are `nonce (12 bytes) || ciphertext || tag (16 bytes)`,
//! base64-encoded when they travel as text.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;

use crate::error::{NodeError, NodeResult};

/// Nonce size for AES-GCM (12 bytes)
pub const NONCE_SIZE: usize = 12;
/// Authentication tag size for AES-GCM (16 bytes)
pub const TAG_SIZE: usize = 16;
/// Group key size (256 bits)
pub const KEY_SIZE: usize = 32;

/// A 256-bit symmetric group key.
///
/// The `Debug` impl never prints key material.
#[derive(Clone, PartialEq, Eq)]
pub struct GroupKey([u8; KEY_SIZE]);

impl GroupKey {
    /// Generate a new random key using the system's CSPRNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Build a key from raw bytes.
    ///
    /// Fails with [`NodeError::InvalidKeyLength`] unless exactly 32 bytes are given.
    pub fn from_slice(bytes: &[u8]) -> NodeResult<Self> {
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| NodeError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Import a base64-encoded key (the export format of `getKeyForGroup`).
    pub fn from_base64(encoded: &str) -> NodeResult<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| NodeError::Serialization(format!("Invalid base64 key: {}", e)))?;
        Self::from_slice(&bytes)
    }

    /// Export the key as standard base64.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl From<[u8; KEY_SIZE]> for GroupKey {
    fn from(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GroupKey(<redacted>)")
    }
}

/// AES-256-GCM cipher bound to one group key.
///
/// # Example
///
/// ```
/// use sealbus_core::crypto::{GroupCipher, GroupKey};
///
/// let key = GroupKey::generate();
/// let cipher = GroupCipher::new(&key);
///
/// let blob = cipher.encrypt_to_base64(b"hello").unwrap();
/// let plain = cipher.decrypt_base64(&blob).unwrap();
///
/// assert_eq!(plain, b"hello");
/// ```
pub struct GroupCipher {
    cipher: Aes256Gcm,
}

impl GroupCipher {
    /// Create a cipher for the given group key.
    pub fn new(key: &GroupKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.as_bytes().into()),
        }
    }

    /// Encrypt to raw bytes: `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> NodeResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| NodeError::CryptoAuth(format!("Encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt raw `nonce || ciphertext || tag` bytes.
    ///
    /// The tag is verified before any plaintext is released.
    pub fn decrypt(&self, blob: &[u8]) -> NodeResult<Vec<u8>> {
        if blob.len() < NONCE_SIZE + TAG_SIZE {
            return Err(NodeError::CryptoAuth(format!(
                "Data too short: {} bytes",
                blob.len()
            )));
        }

        let (nonce, encrypted) = blob.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), encrypted)
            .map_err(|_| NodeError::CryptoAuth("Decryption failed: tag mismatch".to_string()))
    }

    /// Encrypt and base64-encode for transport as text.
    pub fn encrypt_to_base64(&self, plaintext: &[u8]) -> NodeResult<String> {
        Ok(STANDARD.encode(self.encrypt(plaintext)?))
    }

    /// Decode a base64 blob and decrypt it.
    ///
    /// Invalid base64 is reported as [`NodeError::CryptoAuth`] as well.
    pub fn decrypt_base64(&self, blob: &str) -> NodeResult<Vec<u8>> {
        let raw = STANDARD
            .decode(blob.trim())
            .map_err(|e| NodeError::CryptoAuth(format!("Invalid base64 ciphertext: {}", e)))?;
        self.decrypt(&raw)
    }
}

/// Convenience functions for one-shot encryption with a raw key slice.
///
/// A key that is not 32 bytes long is an authentication failure here, which
/// matches how a corrupted key slot has to be treated by callers.
pub mod stateless {
    use super::*;

    fn cipher_for(key: &[u8]) -> NodeResult<GroupCipher> {
        let key = GroupKey::from_slice(key)
            .map_err(|e| NodeError::CryptoAuth(format!("Bad key: {}", e)))?;
        Ok(GroupCipher::new(&key))
    }

    /// Encrypt `plaintext` and return the base64 blob.
    pub fn encrypt(plaintext: &[u8], key: &[u8]) -> NodeResult<String> {
        cipher_for(key)?.encrypt_to_base64(plaintext)
    }

    /// Decrypt a base64 blob.
    pub fn decrypt(blob: &str, key: &[u8]) -> NodeResult<Vec<u8>> {
        cipher_for(key)?.decrypt_base64(blob)
    }
}
