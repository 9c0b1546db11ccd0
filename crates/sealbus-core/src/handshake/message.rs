//! Signed ephemeral-key message exchanged during the handshake.
//!
//! One JSON object per line:
//! `{"publicKey": <base64>, "senderID": <string>, "signature": <base64|null>}`.
//! The signature covers `senderID || "|" || publicKey`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey as X25519PublicKey;

use crate::error::{NodeError, NodeResult};
use crate::identity::{Identity, IdentityPublicKey, IdentitySignature};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhMessage {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(rename = "senderID")]
    pub sender_id: String,
    #[serde(default)]
    pub signature: Option<String>,
}

impl DhMessage {
    /// Build and sign a message announcing `ephemeral`.
    pub fn signed(sender_id: &str, ephemeral: &X25519PublicKey, identity: &Identity) -> Self {
        let public_key = STANDARD.encode(ephemeral.as_bytes());
        let signature = identity.sign(signable(sender_id, &public_key).as_bytes());
        Self {
            public_key,
            sender_id: sender_id.to_string(),
            signature: Some(signature.to_base64()),
        }
    }

    /// Check the signature against the identity the peer is expected to hold.
    ///
    /// Missing, malformed or mismatching signatures are all
    /// [`NodeError::HandshakeAuth`].
    pub fn verify(&self, expected: &IdentityPublicKey) -> NodeResult<()> {
        let encoded = self.signature.as_deref().ok_or_else(|| {
            NodeError::HandshakeAuth(format!("Unsigned message from '{}'", self.sender_id))
        })?;
        let signature = IdentitySignature::from_base64(encoded)
            .map_err(|e| NodeError::HandshakeAuth(e.to_string()))?;

        let payload = signable(&self.sender_id, &self.public_key);
        if !expected.verify(payload.as_bytes(), &signature) {
            return Err(NodeError::HandshakeAuth(format!(
                "Signature from '{}' does not match expected identity {}",
                self.sender_id, expected
            )));
        }
        Ok(())
    }

    /// Decode the announced ephemeral public key.
    pub fn ephemeral_key(&self) -> NodeResult<X25519PublicKey> {
        let bytes = STANDARD
            .decode(&self.public_key)
            .map_err(|e| NodeError::HandshakeAuth(format!("Bad ephemeral key: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            NodeError::HandshakeAuth(format!("Ephemeral key is {} bytes", b.len()))
        })?;
        Ok(X25519PublicKey::from(bytes))
    }

    pub fn to_line(&self) -> NodeResult<String> {
        serde_json::to_string(self).map_err(|e| NodeError::Serialization(e.to_string()))
    }

    pub fn from_line(line: &str) -> NodeResult<Self> {
        serde_json::from_str(line)
            .map_err(|e| NodeError::MalformedMessage(format!("Bad handshake message: {}", e)))
    }
}

/// The exact bytes a handshake signature covers
pub fn signable(sender_id: &str, public_key: &str) -> String {
    format!("{}|{}", sender_id, public_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use x25519_dalek::StaticSecret;

    fn ephemeral() -> X25519PublicKey {
        X25519PublicKey::from(&StaticSecret::from([9u8; 32]))
    }

    #[test]
    fn test_wire_field_names() {
        let identity = Identity::generate();
        let msg = DhMessage::signed("node-a", &ephemeral(), &identity);
        let json: serde_json::Value = serde_json::from_str(&msg.to_line().unwrap()).unwrap();
        assert_eq!(json["senderID"], "node-a");
        assert!(json["publicKey"].is_string());
        assert!(json["signature"].is_string());
    }

    #[test]
    fn test_verify_with_expected_identity() {
        let identity = Identity::generate();
        let msg = DhMessage::signed("node-a", &ephemeral(), &identity);
        msg.verify(&identity.public_key()).unwrap();
        assert_eq!(msg.ephemeral_key().unwrap(), ephemeral());
    }

    #[test]
    fn test_verify_with_other_identity_fails() {
        let msg = DhMessage::signed("node-a", &ephemeral(), &Identity::generate());
        let result = msg.verify(&Identity::generate().public_key());
        assert!(matches!(result, Err(NodeError::HandshakeAuth(_))));
    }

    #[test]
    fn test_sender_id_is_covered_by_signature() {
        let identity = Identity::generate();
        let mut msg = DhMessage::signed("node-a", &ephemeral(), &identity);
        msg.sender_id = "node-b".to_string();
        assert!(msg.verify(&identity.public_key()).is_err());
    }

    #[test]
    fn test_null_signature_rejected() {
        let msg = DhMessage::from_line(r#"{"publicKey":"AAAA","senderID":"x","signature":null}"#)
            .unwrap();
        assert!(matches!(
            msg.verify(&Identity::generate().public_key()),
            Err(NodeError::HandshakeAuth(_))
        ));
    }

    #[test]
    fn test_garbage_line_is_malformed() {
        assert!(matches!(
            DhMessage::from_line("not json"),
            Err(NodeError::MalformedMessage(_))
        ));
    }
}
