//! Node - the primary entry point for sealbus
//!
//! A `Node` coordinates the SecretStore, EnvelopeRouter and EventMultiplexer:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                            Node                              │
//! │                                                              │
//! │  send_text / send_contract ──► EnvelopeRouter ──► Ledger     │
//! │                                   ▲    │                     │
//! │                    on_event_received   └── SecretStore       │
//! │                                   │        (group keys,      │
//! │  ledger event bus ──► EventMultiplexer      identity)        │
//! │                                                              │
//! │  share_group_key / join_group ──► handshake (TCP)            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sealbus_core::{Node, NodeConfig};
//!
//! let config = NodeConfig::new("A", "~/.sealbus/store.redb");
//! let ledger = Arc::new(BusLedger::connect(&config.ledger_endpoint).await?);
//! let node = Node::start(config, "passphrase", ledger).await?;
//!
//! node.create_group("g", Some(Arc::new(|g: &str, msg: &str, from: &str| {
//!     println!("[{}] {}: {}", g, from, msg);
//! })))?;
//! node.send_text("g", "hello").await;
//! ```

use std::sync::Arc;

use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, info};

use crate::bus::{EventMultiplexer, EventSink};
use crate::config::NodeConfig;
use crate::contract::{Contract, ContractProcessor, ContractReceipt};
use crate::error::NodeResult;
use crate::handshake;
use crate::identity::IdentityPublicKey;
use crate::ledger::Ledger;
use crate::router::{EnvelopeRouter, GroupCallback, ReceiptCallback};
use crate::storage::SecretStore;

pub struct Node {
    config: NodeConfig,
    store: Arc<SecretStore>,
    router: Arc<EnvelopeRouter>,
    multiplexer: EventMultiplexer,
}

impl Node {
    /// Open (or create) the store, connect to the event bus and subscribe to
    /// every group already held.
    pub async fn start(
        config: NodeConfig,
        passphrase: &str,
        ledger: Arc<dyn Ledger>,
    ) -> NodeResult<Self> {
        let store = Arc::new(SecretStore::open_or_create(&config.store_path, passphrase)?);
        let router = Arc::new(EnvelopeRouter::new(
            config.node_id.clone(),
            config.namespace_prefix.clone(),
            store.clone(),
            ledger,
            config.dedup_capacity,
        ));

        let sink: Arc<dyn EventSink> = router.clone();
        let multiplexer = EventMultiplexer::connect(
            &config.ledger_endpoint,
            &config.namespace_prefix,
            config.receive_timeout(),
            sink,
        )
        .await?;

        for group in store.group_names() {
            multiplexer.subscribe_to_group(&group)?;
        }

        info!(
            node_id = %config.node_id,
            groups = store.group_names().len(),
            "Node started"
        );
        Ok(Self {
            config,
            store,
            router,
            multiplexer,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SecretStore> {
        &self.store
    }

    pub fn router(&self) -> &Arc<EnvelopeRouter> {
        &self.router
    }

    pub fn identity_public_key(&self) -> IdentityPublicKey {
        self.store.identity_public_key()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Groups
    // ═══════════════════════════════════════════════════════════════════════

    /// Create `group` with a fresh key and start listening to it.
    pub fn create_group(
        &self,
        group: &str,
        callback: Option<Arc<dyn GroupCallback>>,
    ) -> NodeResult<()> {
        self.store.create_group(group)?;
        self.attach(group, callback)
    }

    /// Import `group` with a known base64 key and start listening to it.
    pub fn add_group(
        &self,
        group: &str,
        base64_key: &str,
        callback: Option<Arc<dyn GroupCallback>>,
    ) -> NodeResult<()> {
        self.store.add_group(group, base64_key)?;
        self.attach(group, callback)
    }

    pub fn add_callback_to_group(&self, group: &str, callback: Arc<dyn GroupCallback>) {
        self.router.add_callback_to_group(group, callback);
    }

    pub fn subscribe_to_group(&self, group: &str) -> NodeResult<()> {
        self.multiplexer.subscribe_to_group(group)
    }

    /// Forget the key and callbacks of `group`.
    ///
    /// The bus subscription stays; later events for the group are dropped as
    /// unknown.
    pub fn remove_group(&self, group: &str) -> NodeResult<bool> {
        let removed = self.store.remove_group(group)?;
        let callbacks = self.router.remove_group_callbacks(group);
        debug!(group = %group, removed, callbacks, "Removed group");
        Ok(removed)
    }

    pub fn group_names(&self) -> Vec<String> {
        self.store.group_names()
    }

    fn attach(&self, group: &str, callback: Option<Arc<dyn GroupCallback>>) -> NodeResult<()> {
        if let Some(callback) = callback {
            self.router.add_callback_to_group(group, callback);
        }
        self.multiplexer.subscribe_to_group(group)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Messaging
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn send_text(&self, group: &str, message: &str) -> bool {
        self.router.send_text(group, message).await
    }

    /// Build a contract issued by this node.
    pub fn new_contract(
        &self,
        requested_processor: Option<&str>,
        operation: &str,
        args: Vec<String>,
    ) -> Contract {
        Contract::new(
            &self.config.namespace_prefix,
            self.config.node_id.as_str(),
            requested_processor,
            operation,
            args,
        )
    }

    pub async fn send_contract(
        &self,
        group: &str,
        contract: &Contract,
        callback: Option<Arc<dyn ReceiptCallback>>,
    ) -> bool {
        self.router.send_contract(group, contract, callback).await
    }

    pub async fn fetch_receipt(
        &self,
        group: &str,
        contract: &Contract,
    ) -> NodeResult<Option<ContractReceipt>> {
        self.router.fetch_receipt(group, contract).await
    }

    pub fn add_contract_processor(&self, processor: Arc<dyn ContractProcessor>) {
        self.router.add_contract_processor(processor);
    }

    pub fn remove_contract_processor(&self, processor: &Arc<dyn ContractProcessor>) -> bool {
        self.router.remove_contract_processor(processor)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Joining groups
    // ═══════════════════════════════════════════════════════════════════════

    /// Hand the key of `group` to the next applicant on `listener`, who must
    /// prove it holds `peer_key`.
    pub async fn share_group_key(
        &self,
        listener: &TcpListener,
        group: &str,
        peer_key: &IdentityPublicKey,
    ) -> NodeResult<()> {
        handshake::serve_group_key(
            listener,
            &self.store,
            group,
            &self.config.node_id,
            peer_key,
            self.config.handshake_timeout(),
        )
        .await
    }

    /// Fetch the key of `group` from the member at `addr`, then listen to it.
    pub async fn join_group<A: ToSocketAddrs>(
        &self,
        addr: A,
        group: &str,
        peer_key: &IdentityPublicKey,
        callback: Option<Arc<dyn GroupCallback>>,
    ) -> NodeResult<()> {
        handshake::request_group_key(
            addr,
            &self.store,
            group,
            &self.config.node_id,
            peer_key,
            self.config.handshake_timeout(),
        )
        .await?;
        self.attach(group, callback)
    }

    /// Stop the event loop. Idempotent.
    pub async fn close(&self) {
        self.multiplexer.close().await;
        info!(node_id = %self.config.node_id, "Node closed");
    }

    pub fn is_running(&self) -> bool {
        self.multiplexer.is_running()
    }
}
