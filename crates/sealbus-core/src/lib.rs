//! Sealbus Core Library
//!
//! Confidential group messaging over a shared, append-only ledger.
//!
//! ## Overview
//!
//! Every message is encrypted with its group's AES-256-GCM key before it is
//! submitted, so the ledger only ever stores ciphertext. Nodes subscribe to
//! ledger events for the groups they hold keys for, decrypt what arrives and
//! dispatch it: text goes to registered callbacks, contracts to contract
//! processors (whose results come back as receipts).
//!
//! Group keys never travel through the ledger. A new member obtains one from
//! an existing member over an authenticated Diffie–Hellman handshake.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use sealbus_core::{BusLedger, Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::new("alice", "alice.redb");
//!     let ledger = Arc::new(BusLedger::connect(&config.ledger_endpoint).await?);
//!     let node = Node::start(config, "passphrase", ledger).await?;
//!
//!     node.create_group("team", None)?;
//!     node.send_text("team", "hello").await;
//!
//!     node.close().await;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod bus;
pub mod config;
pub mod contract;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod ledger;
pub mod node;
pub mod router;
pub mod storage;

// Re-exports
pub use bus::{BusLedger, BusServer, BusServerHandle, EventMultiplexer, EventSink};
pub use config::NodeConfig;
pub use contract::{Contract, ContractProcessor, ContractReceipt, SumContractProcessor};
pub use crypto::{GroupCipher, GroupKey};
pub use envelope::{Envelope, EnvelopeKind};
pub use error::{NodeError, NodeResult};
pub use handshake::{EncryptedStream, HandshakeRole, HandshakeSession, HandshakeState};
pub use identity::{Identity, IdentityPublicKey, IdentitySignature};
pub use ledger::{Ledger, LedgerPayload, MemoryLedger};
pub use node::Node;
pub use router::{EnvelopeRouter, GroupCallback, ReceiptCallback};
pub use storage::SecretStore;
