//! Node configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::DEFAULT_NAMESPACE_PREFIX;
use crate::error::{NodeError, NodeResult};

pub const DEFAULT_LEDGER_ENDPOINT: &str = "127.0.0.1:5555";
pub const DEFAULT_STORE_FILE: &str = "sealbus.redb";
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 300;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_DEDUP_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Client ID this node signs envelopes and handshakes with
    pub node_id: String,
    pub store_path: PathBuf,
    /// `host:port` of the ledger event bus
    pub ledger_endpoint: String,
    pub namespace_prefix: String,
    pub receive_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// 0 disables envelope de-duplication
    pub dedup_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            store_path: PathBuf::from(DEFAULT_STORE_FILE),
            ledger_endpoint: DEFAULT_LEDGER_ENDPOINT.to_string(),
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>, store_path: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.into(),
            store_path: store_path.into(),
            ..Self::default()
        }
    }

    pub fn with_ledger_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.ledger_endpoint = endpoint.into();
        self
    }

    pub fn with_namespace_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.namespace_prefix = prefix.into();
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Load a JSON config. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> NodeResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| {
            NodeError::Serialization(format!("Bad config {}: {}", path.display(), e))
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> NodeResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| NodeError::Serialization(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
