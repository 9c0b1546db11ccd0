//! Envelopes: the typed unit of content encrypted per group.
//!
//! On the wire an envelope is JSON
//! `{"sender", "type": "text"|"contract"|"contract_receipt", "rawMessage", "uuid"}`
//! where `rawMessage` holds the text, or the contract or receipt as a nested
//! JSON string. The type is resolved once into [`EnvelopeKind`] when parsing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contract::{Contract, ContractReceipt};
use crate::error::{NodeError, NodeResult};

pub const TYPE_TEXT: &str = "text";
pub const TYPE_CONTRACT: &str = "contract";
pub const TYPE_CONTRACT_RECEIPT: &str = "contract_receipt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeKind {
    Text(String),
    Contract(Contract),
    ContractReceipt(ContractReceipt),
}

impl EnvelopeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EnvelopeKind::Text(_) => TYPE_TEXT,
            EnvelopeKind::Contract(_) => TYPE_CONTRACT,
            EnvelopeKind::ContractReceipt(_) => TYPE_CONTRACT_RECEIPT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub kind: EnvelopeKind,
    /// Unique per envelope. Empty when the sender did not supply one.
    pub uuid: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    sender: String,
    #[serde(rename = "type")]
    kind: String,
    raw_message: String,
    #[serde(default)]
    uuid: String,
}

impl Envelope {
    pub fn new(sender: impl Into<String>, kind: EnvelopeKind) -> Self {
        Self {
            sender: sender.into(),
            kind,
            uuid: Uuid::new_v4().to_string(),
        }
    }

    pub fn text(sender: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(sender, EnvelopeKind::Text(message.into()))
    }

    pub fn contract(sender: impl Into<String>, contract: Contract) -> Self {
        Self::new(sender, EnvelopeKind::Contract(contract))
    }

    pub fn receipt(sender: impl Into<String>, receipt: ContractReceipt) -> Self {
        Self::new(sender, EnvelopeKind::ContractReceipt(receipt))
    }

    pub fn to_json(&self) -> NodeResult<String> {
        let raw_message = match &self.kind {
            EnvelopeKind::Text(text) => text.clone(),
            EnvelopeKind::Contract(contract) => contract.to_json()?,
            EnvelopeKind::ContractReceipt(receipt) => receipt.to_json()?,
        };
        let wire = WireEnvelope {
            sender: self.sender.clone(),
            kind: self.kind.type_name().to_string(),
            raw_message,
            uuid: self.uuid.clone(),
        };
        serde_json::to_string(&wire).map_err(|e| NodeError::Serialization(e.to_string()))
    }

    /// Parse an envelope, resolving its payload by type.
    ///
    /// Unknown types and unparsable payloads are
    /// [`NodeError::MalformedMessage`].
    pub fn from_json(json: &str) -> NodeResult<Self> {
        let wire: WireEnvelope = serde_json::from_str(json)
            .map_err(|e| NodeError::MalformedMessage(format!("Bad envelope: {}", e)))?;

        let kind = match wire.kind.as_str() {
            TYPE_TEXT => EnvelopeKind::Text(wire.raw_message),
            TYPE_CONTRACT => EnvelopeKind::Contract(Contract::from_json(&wire.raw_message)?),
            TYPE_CONTRACT_RECEIPT => {
                EnvelopeKind::ContractReceipt(ContractReceipt::from_json(&wire.raw_message)?)
            }
            other => {
                return Err(NodeError::MalformedMessage(format!(
                    "Unknown envelope type '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            sender: wire.sender,
            kind,
            uuid: wire.uuid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::DEFAULT_NAMESPACE_PREFIX;

    #[test]
    fn test_text_wire_format() {
        let envelope = Envelope::text("A", "hello");
        let value: serde_json::Value =
            serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(value["sender"], "A");
        assert_eq!(value["type"], "text");
        assert_eq!(value["rawMessage"], "hello");
        assert_eq!(value["uuid"], envelope.uuid.as_str());
    }

    #[test]
    fn test_contract_is_nested_json_string() {
        let contract = Contract::new(DEFAULT_NAMESPACE_PREFIX, "A", None, "sum", vec![]);
        let envelope = Envelope::contract("A", contract.clone());
        let value: serde_json::Value =
            serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "contract");
        assert!(value["rawMessage"].is_string());

        let parsed = Envelope::from_json(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(parsed.kind, EnvelopeKind::Contract(contract));
    }

    #[test]
    fn test_missing_uuid_accepted() {
        let parsed = Envelope::from_json(r#"{"sender":"A","type":"text","rawMessage":"hi"}"#)
            .unwrap();
        assert!(parsed.uuid.is_empty());
        assert_eq!(parsed.kind, EnvelopeKind::Text("hi".to_string()));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = Envelope::from_json(r#"{"sender":"A","type":"video","rawMessage":""}"#);
        assert!(matches!(result, Err(NodeError::MalformedMessage(_))));
    }

    #[test]
    fn test_bad_contract_payload_rejected() {
        let result =
            Envelope::from_json(r#"{"sender":"A","type":"contract","rawMessage":"{oops"}"#);
        assert!(matches!(result, Err(NodeError::MalformedMessage(_))));
    }

    #[test]
    fn test_each_envelope_gets_fresh_uuid() {
        assert_ne!(Envelope::text("A", "x").uuid, Envelope::text("A", "x").uuid);
    }
}
