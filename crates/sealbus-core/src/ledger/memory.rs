//! In-process ledger.
//!
//! Applies payloads like the message transaction processor: the payload is
//! written to the requested output address, or to an address derived from the
//! blob when the output is the namespace itself, and an event of type
//! `<group>` carrying the address is fired.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::event::{LedgerEvent, ADDRESS_ATTRIBUTE};
use super::{Ledger, LedgerPayload};
use crate::address::{is_valid_address, namespace_hash_address, DEFAULT_NAMESPACE_PREFIX};
use crate::error::{NodeError, NodeResult};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct MemoryLedger {
    namespace_prefix: String,
    state: RwLock<HashMap<String, Vec<u8>>>,
    events: broadcast::Sender<LedgerEvent>,
}

impl MemoryLedger {
    pub fn new(namespace_prefix: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            namespace_prefix: namespace_prefix.into(),
            state: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn namespace_prefix(&self) -> &str {
        &self.namespace_prefix
    }

    /// Receive every event fired from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Apply one raw payload and return the address it was written to.
    ///
    /// Applying the same payload twice writes the same address again and
    /// fires a second event.
    pub fn apply(&self, payload: &[u8], output_addr: Option<&str>) -> NodeResult<String> {
        if payload.is_empty() {
            return Err(NodeError::MalformedMessage("Payload is empty".to_string()));
        }
        let parsed = LedgerPayload::from_bytes(payload)?;

        let address = match output_addr {
            None => namespace_hash_address(&self.namespace_prefix, &parsed.blob),
            Some(out) if out == self.namespace_prefix => {
                namespace_hash_address(&self.namespace_prefix, &parsed.blob)
            }
            Some(out) => {
                if !is_valid_address(out) || !out.starts_with(&self.namespace_prefix) {
                    return Err(NodeError::MalformedMessage(format!(
                        "Output address {} is outside namespace {}",
                        out, self.namespace_prefix
                    )));
                }
                out.to_string()
            }
        };

        self.state.write().insert(address.clone(), payload.to_vec());

        let event = LedgerEvent {
            event_type: parsed.group.clone(),
            attributes: vec![(ADDRESS_ATTRIBUTE.to_string(), address.clone())],
            data: payload.to_vec(),
        };
        // No receivers is fine: nobody is listening yet.
        let receivers = self.events.send(event).unwrap_or(0);
        debug!(
            group = %parsed.group,
            address = %address,
            receivers,
            "Applied transaction"
        );

        Ok(address)
    }

    /// State at `address`, if any.
    pub fn state_at(&self, address: &str) -> Option<Vec<u8>> {
        self.state.read().get(address).cloned()
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE_PREFIX)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn submit(
        &self,
        payload: &LedgerPayload,
        output_addr: Option<&str>,
    ) -> NodeResult<bool> {
        match self.apply(payload.to_wire().as_bytes(), output_addr) {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!(group = %payload.group, error = %e, "Transaction rejected");
                Ok(false)
            }
        }
    }

    async fn query_state(&self, address: &str) -> NodeResult<Option<Vec<u8>>> {
        Ok(self.state_at(address))
    }
}
