//! Ledger collaborator.
//!
//! The node never talks to a ledger implementation directly; the router
//! submits `"<group>,<blob>"` payloads through the [`Ledger`] trait and reads
//! contract results back with [`Ledger::query_state`]. [`MemoryLedger`] is an
//! in-process implementation that applies payloads the same way the ledger's
//! transaction processor does.

mod event;
mod memory;

pub use event::{EventFilter, EventSubscription, LedgerEvent, ADDRESS_ATTRIBUTE};
pub use memory::MemoryLedger;

use async_trait::async_trait;

use crate::error::{NodeError, NodeResult};
use crate::storage::GROUP_SEPARATOR;

/// Submission and state access on the append-only ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Submit a payload as a transaction.
    ///
    /// `output_addr` targets a specific state address; `None` lets the ledger
    /// derive one inside the namespace. Returns whether the ledger accepted
    /// the transaction.
    async fn submit(&self, payload: &LedgerPayload, output_addr: Option<&str>)
        -> NodeResult<bool>;

    /// Read the raw state stored at `address`.
    async fn query_state(&self, address: &str) -> NodeResult<Option<Vec<u8>>>;
}

/// A transaction payload: clear-text group name and encrypted blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPayload {
    pub group: String,
    pub blob: String,
}

impl LedgerPayload {
    pub fn new(group: impl Into<String>, blob: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            blob: blob.into(),
        }
    }

    /// Parse `"<group>,<blob>"`.
    ///
    /// Payloads with fewer than two fields are rejected.
    pub fn parse(payload: &str) -> NodeResult<Self> {
        let mut fields = payload.split(GROUP_SEPARATOR);
        match (fields.next(), fields.next()) {
            (Some(group), Some(blob)) => Ok(Self::new(group, blob)),
            _ => Err(NodeError::MalformedMessage(format!(
                "Expected '<group>{}<blob>', got {} bytes without separator",
                GROUP_SEPARATOR,
                payload.len()
            ))),
        }
    }

    /// Parse a payload received as raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> NodeResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| NodeError::MalformedMessage(format!("Payload is not UTF-8: {}", e)))?;
        Self::parse(text)
    }

    pub fn to_wire(&self) -> String {
        format!("{}{}{}", self.group, GROUP_SEPARATOR, self.blob)
    }
}

impl std::fmt::Display for LedgerPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.group, GROUP_SEPARATOR, self.blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_parse() {
        let payload = LedgerPayload::parse("g,QUJD").unwrap();
        assert_eq!(payload.group, "g");
        assert_eq!(payload.blob, "QUJD");
        assert_eq!(payload.to_wire(), "g,QUJD");
        assert_eq!(payload.to_string(), "g,QUJD");
    }

    #[test]
    fn test_payload_without_separator_rejected() {
        assert!(matches!(
            LedgerPayload::parse("no-separator"),
            Err(NodeError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_payload_extra_fields_use_second() {
        let payload = LedgerPayload::parse("g,blob,trailing").unwrap();
        assert_eq!(payload.blob, "blob");
    }

    #[test]
    fn test_payload_non_utf8_rejected() {
        assert!(LedgerPayload::from_bytes(&[0xff, b',', 0xfe]).is_err());
    }
}
