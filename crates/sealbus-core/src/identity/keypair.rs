//! secp256k1 identity keypair
//!
//! Ledger-compatible signing identity: compressed SEC1 public keys, 64-byte
//! ECDSA signatures over SHA-256 of the message.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::RngCore;

use crate::error::{NodeError, NodeResult};

/// Size of a compact `r || s` signature
pub const SIGNATURE_SIZE: usize = 64;

/// Long-term signing keypair of a node.
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        loop {
            let mut seed = [0u8; 32];
            rand::rng().fill_bytes(&mut seed);
            // A seed outside the curve order is astronomically unlikely; redraw.
            if let Ok(signing_key) = SigningKey::from_slice(&seed) {
                return Self { signing_key };
            }
        }
    }

    /// Restore an identity from its 32-byte private scalar.
    pub fn from_bytes(bytes: &[u8]) -> NodeResult<Self> {
        let signing_key = SigningKey::from_slice(bytes)
            .map_err(|e| NodeError::Identity(format!("Invalid private key: {}", e)))?;
        Ok(Self { signing_key })
    }

    /// Restore an identity from the hex form produced by [`Identity::to_hex`].
    pub fn from_hex(private_key_hex: &str) -> NodeResult<Self> {
        let bytes = hex::decode(private_key_hex.trim())
            .map_err(|e| NodeError::Identity(format!("Invalid private key hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Private scalar bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }

    /// Private scalar as lowercase hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Public half of this identity
    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            key: self.signing_key.verifying_key().clone(),
        }
    }

    /// Sign a message (ECDSA over SHA-256).
    pub fn sign(&self, message: &[u8]) -> IdentitySignature {
        let signature: Signature = self.signing_key.sign(message);
        IdentitySignature(signature)
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            signing_key: self.signing_key.clone(),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key().to_hex())
            .finish_non_exhaustive()
    }
}

/// Public identity key, used to verify handshake messages.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityPublicKey {
    key: VerifyingKey,
}

impl IdentityPublicKey {
    /// Parse a hex-encoded SEC1 point (compressed or uncompressed).
    pub fn from_hex(public_key_hex: &str) -> NodeResult<Self> {
        let bytes = hex::decode(public_key_hex.trim())
            .map_err(|e| NodeError::Identity(format!("Invalid public key hex: {}", e)))?;
        let key = VerifyingKey::from_sec1_bytes(&bytes)
            .map_err(|e| NodeError::Identity(format!("Invalid public key: {}", e)))?;
        Ok(Self { key })
    }

    /// Compressed SEC1 encoding (33 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        self.key.to_encoded_point(true).as_bytes().to_vec()
    }

    /// Compressed SEC1 encoding as lowercase hex (66 characters)
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Verify a signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &IdentitySignature) -> bool {
        self.key.verify(message, &signature.0).is_ok()
    }
}

impl std::fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("IdentityPublicKey")
            .field(&self.to_hex())
            .finish()
    }
}

impl std::fmt::Display for IdentityPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// ECDSA signature produced by an [`Identity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySignature(Signature);

impl IdentitySignature {
    /// Parse a compact 64-byte signature.
    pub fn from_bytes(bytes: &[u8]) -> NodeResult<Self> {
        if bytes.len() != SIGNATURE_SIZE {
            return Err(NodeError::Identity(format!(
                "Invalid signature size: expected {} bytes, got {}",
                SIGNATURE_SIZE,
                bytes.len()
            )));
        }
        let signature = Signature::from_slice(bytes)
            .map_err(|e| NodeError::Identity(format!("Invalid signature: {}", e)))?;
        Ok(Self(signature))
    }

    /// Parse a base64-encoded compact signature.
    pub fn from_base64(encoded: &str) -> NodeResult<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| NodeError::Identity(format!("Invalid signature base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Compact `r || s` bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    /// Compact bytes as standard base64
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }
}
