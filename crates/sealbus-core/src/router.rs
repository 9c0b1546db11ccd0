//! Envelope router: message-level protocol on top of the group cipher.
//!
//! Outbound, it wraps text, contracts and receipts in an [`Envelope`],
//! encrypts it with the group key and submits `"<group>,<blob>"` to the
//! ledger. Inbound, it decrypts event payloads handed over by the
//! [`EventMultiplexer`](crate::bus::EventMultiplexer) and dispatches by
//! envelope kind.
//!
//! Per-message failures (unknown group, bad ciphertext, malformed envelope,
//! no matching processor) are logged and the message is dropped; they never
//! reach the event loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::bus::EventSink;
use crate::contract::{Contract, ContractProcessor, ContractReceipt};
use crate::crypto::GroupCipher;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{NodeError, NodeResult};
use crate::ledger::{Ledger, LedgerPayload};
use crate::storage::SecretStore;

/// Receives text messages for a group.
pub trait GroupCallback: Send + Sync {
    fn on_message(&self, group: &str, message: &str, sender: &str);
}

impl<F> GroupCallback for F
where
    F: Fn(&str, &str, &str) + Send + Sync,
{
    fn on_message(&self, group: &str, message: &str, sender: &str) {
        self(group, message, sender)
    }
}

/// Receives the receipt of a contract this node sent.
pub trait ReceiptCallback: Send + Sync {
    fn on_receipt(&self, receipt: &ContractReceipt);
}

impl<F> ReceiptCallback for F
where
    F: Fn(&ContractReceipt) + Send + Sync,
{
    fn on_receipt(&self, receipt: &ContractReceipt) {
        self(receipt)
    }
}

/// Bounded set of recently seen envelope IDs, oldest evicted first.
struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            seen: HashSet::new(),
        }
    }

    /// Record `id`; returns `false` if it was already in the window.
    fn insert(&mut self, id: &str) -> bool {
        if self.capacity == 0 || id.is_empty() {
            return true;
        }
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

pub struct EnvelopeRouter {
    node_id: String,
    namespace_prefix: String,
    store: Arc<SecretStore>,
    ledger: Arc<dyn Ledger>,
    callbacks: RwLock<HashMap<String, Vec<Arc<dyn GroupCallback>>>>,
    receipt_callbacks: RwLock<HashMap<String, Arc<dyn ReceiptCallback>>>,
    processors: RwLock<Vec<Arc<dyn ContractProcessor>>>,
    dedup: Mutex<DedupWindow>,
}

impl EnvelopeRouter {
    /// `dedup_capacity` of 0 disables envelope de-duplication.
    pub fn new(
        node_id: impl Into<String>,
        namespace_prefix: impl Into<String>,
        store: Arc<SecretStore>,
        ledger: Arc<dyn Ledger>,
        dedup_capacity: usize,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            namespace_prefix: namespace_prefix.into(),
            store,
            ledger,
            callbacks: RwLock::new(HashMap::new()),
            receipt_callbacks: RwLock::new(HashMap::new()),
            processors: RwLock::new(Vec::new()),
            dedup: Mutex::new(DedupWindow::new(dedup_capacity)),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn namespace_prefix(&self) -> &str {
        &self.namespace_prefix
    }

    pub fn store(&self) -> &Arc<SecretStore> {
        &self.store
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Registries
    // ═══════════════════════════════════════════════════════════════════════

    /// Register `callback` for text messages in `group`.
    ///
    /// Registering the same callback twice has no effect.
    pub fn add_callback_to_group(&self, group: &str, callback: Arc<dyn GroupCallback>) {
        let mut callbacks = self.callbacks.write();
        let list = callbacks.entry(group.to_string()).or_default();
        if list.iter().any(|c| Arc::ptr_eq(c, &callback)) {
            debug!(group = %group, "Callback already registered");
            return;
        }
        list.push(callback);
    }

    /// Drop every callback registered for `group`.
    pub fn remove_group_callbacks(&self, group: &str) -> usize {
        self.callbacks
            .write()
            .remove(group)
            .map(|list| list.len())
            .unwrap_or(0)
    }

    pub fn callback_count(&self, group: &str) -> usize {
        self.callbacks.read().get(group).map(Vec::len).unwrap_or(0)
    }

    pub fn add_contract_processor(&self, processor: Arc<dyn ContractProcessor>) {
        self.processors.write().push(processor);
    }

    /// Unregister `processor`. Returns whether it was registered.
    pub fn remove_contract_processor(&self, processor: &Arc<dyn ContractProcessor>) -> bool {
        let mut processors = self.processors.write();
        let before = processors.len();
        processors.retain(|p| !Arc::ptr_eq(p, processor));
        processors.len() != before
    }

    /// Forget the receipt callback of `contract_id`.
    pub fn remove_contract_callback(&self, contract_id: &str) -> bool {
        self.receipt_callbacks.write().remove(contract_id).is_some()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sending
    // ═══════════════════════════════════════════════════════════════════════

    /// Send a text message to `group`.
    ///
    /// Returns whether the ledger accepted the transaction. Empty input or an
    /// unknown group is a logged no-op returning `false`.
    pub async fn send_text(&self, group: &str, message: &str) -> bool {
        if group.is_empty() || message.is_empty() {
            warn!("Empty group and/or message");
            return false;
        }
        let envelope = Envelope::text(&self.node_id, message);
        self.send_envelope(group, &envelope, &self.namespace_prefix)
            .await
    }

    /// Send a contract to `group`, optionally waiting for its receipt.
    ///
    /// The contract is written to its `output_addr`. `callback` fires for
    /// every receipt that comes back for this contract until removed with
    /// [`remove_contract_callback`](Self::remove_contract_callback).
    pub async fn send_contract(
        &self,
        group: &str,
        contract: &Contract,
        callback: Option<Arc<dyn ReceiptCallback>>,
    ) -> bool {
        if group.is_empty() {
            warn!("Empty group");
            return false;
        }

        if let Some(callback) = callback {
            self.receipt_callbacks
                .write()
                .insert(contract.contract_id.clone(), callback);
        }

        let envelope = Envelope::contract(&self.node_id, contract.clone());
        let sent = self
            .send_envelope(group, &envelope, &contract.output_addr)
            .await;
        if !sent {
            self.remove_contract_callback(&contract.contract_id);
        }
        sent
    }

    async fn send_receipt(&self, group: &str, receipt: ContractReceipt) -> bool {
        let target = receipt.contract.result_output_addr.clone();
        let envelope = Envelope::receipt(&self.node_id, receipt);
        self.send_envelope(group, &envelope, &target).await
    }

    async fn send_envelope(&self, group: &str, envelope: &Envelope, output_addr: &str) -> bool {
        let Some(key) = self.store.group_key(group) else {
            warn!(group = %group, "No key for group, not sending");
            return false;
        };

        let blob = match envelope
            .to_json()
            .and_then(|json| GroupCipher::new(&key).encrypt_to_base64(json.as_bytes()))
        {
            Ok(blob) => blob,
            Err(e) => {
                warn!(group = %group, error = %e, "Failed to seal envelope");
                return false;
            }
        };

        let payload = LedgerPayload::new(group, blob);
        match self.ledger.submit(&payload, Some(output_addr)).await {
            Ok(accepted) => {
                debug!(
                    group = %group,
                    kind = envelope.kind.type_name(),
                    accepted,
                    "Submitted envelope"
                );
                accepted
            }
            Err(e) => {
                warn!(group = %group, error = %e, "Ledger submission failed");
                false
            }
        }
    }

    /// Read the receipt written to `contract`'s result address, if any.
    pub async fn fetch_receipt(
        &self,
        group: &str,
        contract: &Contract,
    ) -> NodeResult<Option<ContractReceipt>> {
        let key = self
            .store
            .group_key(group)
            .ok_or_else(|| NodeError::UnknownGroup(group.to_string()))?;

        let Some(state) = self.ledger.query_state(&contract.result_output_addr).await? else {
            return Ok(None);
        };
        let payload = LedgerPayload::from_bytes(&state)?;
        if payload.group != group {
            return Err(NodeError::MalformedMessage(format!(
                "Result address holds a payload for group '{}'",
                payload.group
            )));
        }

        let plain = GroupCipher::new(&key).decrypt_base64(&payload.blob)?;
        let json = String::from_utf8(plain)
            .map_err(|e| NodeError::MalformedMessage(format!("Envelope is not UTF-8: {}", e)))?;
        match Envelope::from_json(&json)?.kind {
            EnvelopeKind::ContractReceipt(receipt)
                if receipt.contract.contract_id == contract.contract_id =>
            {
                Ok(Some(receipt))
            }
            other => Err(NodeError::MalformedMessage(format!(
                "Result address holds a {} envelope for another contract",
                other.type_name()
            ))),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Receiving
    // ═══════════════════════════════════════════════════════════════════════

    /// Decrypt and dispatch one event payload. Never fails.
    pub async fn handle_event(&self, group: &str, blob: &str) {
        let envelope = match self.open_envelope(group, blob) {
            Ok(envelope) => envelope,
            Err(NodeError::UnknownGroup(_)) => {
                info!(group = %group, "Received message for group without key, dropping");
                return;
            }
            Err(e) if e.is_per_message() => {
                warn!(group = %group, error = %e, "Dropping undecryptable message");
                return;
            }
            Err(e) => {
                error!(group = %group, error = %e, "Failed to open message, dropping");
                return;
            }
        };

        let fresh = self.dedup.lock().insert(&envelope.uuid);
        if !fresh {
            debug!(group = %group, uuid = %envelope.uuid, "Duplicate envelope, skipping");
            return;
        }

        let sender = envelope.sender;
        match envelope.kind {
            EnvelopeKind::Text(message) => self.dispatch_text(group, &message, &sender),
            EnvelopeKind::Contract(contract) => self.dispatch_contract(group, contract).await,
            EnvelopeKind::ContractReceipt(receipt) => self.dispatch_receipt(group, &receipt),
        }
    }

    fn open_envelope(&self, group: &str, blob: &str) -> NodeResult<Envelope> {
        let key = self
            .store
            .group_key(group)
            .ok_or_else(|| NodeError::UnknownGroup(group.to_string()))?;
        let plain = GroupCipher::new(&key).decrypt_base64(blob)?;
        let json = String::from_utf8(plain)
            .map_err(|e| NodeError::MalformedMessage(format!("Envelope is not UTF-8: {}", e)))?;
        Envelope::from_json(&json)
    }

    fn dispatch_text(&self, group: &str, message: &str, sender: &str) {
        let callbacks = self.callbacks.read().get(group).cloned().unwrap_or_default();
        debug!(group = %group, sender = %sender, callbacks = callbacks.len(), "Text message");
        for callback in callbacks {
            callback.on_message(group, message, sender);
        }
    }

    async fn dispatch_contract(&self, group: &str, contract: Contract) {
        if !contract.is_addressed_to(&self.node_id) {
            debug!(
                contract = %contract.contract_id,
                requested = %contract.requested_processor,
                "Contract not for this node"
            );
            return;
        }

        let candidates: Vec<_> = self
            .processors
            .read()
            .iter()
            .filter(|p| p.supports(&contract.operation))
            .cloned()
            .collect();
        if candidates.is_empty() {
            info!(
                contract = %contract.contract_id,
                operation = %contract.operation,
                "No processor for contract"
            );
            return;
        }

        // Registration order; the first processor with a result answers
        let Some(result) = candidates
            .iter()
            .find_map(|processor| processor.process_contract(&contract))
        else {
            info!(contract = %contract.contract_id, "No processor produced a result");
            return;
        };

        debug!(contract = %contract.contract_id, result = %result, "Contract processed");
        let receipt = ContractReceipt::new(&self.node_id, result, contract);
        if !self.send_receipt(group, receipt).await {
            warn!(group = %group, "Failed to send contract receipt");
        }
    }

    fn dispatch_receipt(&self, group: &str, receipt: &ContractReceipt) {
        let callback = self
            .receipt_callbacks
            .read()
            .get(&receipt.contract.contract_id)
            .cloned();
        match callback {
            Some(callback) => {
                debug!(
                    group = %group,
                    contract = %receipt.contract.contract_id,
                    processor = %receipt.processor,
                    "Receipt received"
                );
                callback.on_receipt(receipt);
            }
            None => debug!(
                contract = %receipt.contract.contract_id,
                "Receipt for unknown contract"
            ),
        }
    }
}

#[async_trait]
impl EventSink for EnvelopeRouter {
    async fn on_event_received(&self, group: &str, blob: &str) {
        self.handle_event(group, blob).await
    }
}
