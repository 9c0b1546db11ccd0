//! Contracts: remote-execution requests carried inside envelopes.
//!
//! A contract names an operation and its arguments, optionally a specific
//! processor node, and two precomputed ledger addresses: where the contract
//! itself is written and where its result should land.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::namespace_hash_address;
use crate::error::{NodeError, NodeResult};

/// `requestedProcessor` value accepted by every node
pub const REQUESTED_PROCESSOR_ANY: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    #[serde(rename = "contractID")]
    pub contract_id: String,
    pub issuer: String,
    pub requested_processor: String,
    pub operation: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Address this contract is written to
    pub output_addr: String,
    /// Address the receipt should be written to
    pub result_output_addr: String,
}

impl Contract {
    /// Build a contract with a fresh ID and derived addresses.
    ///
    /// `requested_processor` of `None` means any node may process it.
    pub fn new(
        namespace_prefix: &str,
        issuer: impl Into<String>,
        requested_processor: Option<&str>,
        operation: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        let contract_id = Uuid::new_v4().to_string();
        let output_addr = namespace_hash_address(namespace_prefix, &contract_id);
        let result_output_addr =
            namespace_hash_address(namespace_prefix, &Uuid::new_v4().to_string());

        Self {
            contract_id,
            issuer: issuer.into(),
            requested_processor: requested_processor
                .unwrap_or(REQUESTED_PROCESSOR_ANY)
                .to_string(),
            operation: operation.into(),
            args,
            output_addr,
            result_output_addr,
        }
    }

    /// Whether `node_id` may process this contract.
    pub fn is_addressed_to(&self, node_id: &str) -> bool {
        self.requested_processor == REQUESTED_PROCESSOR_ANY || self.requested_processor == node_id
    }

    pub fn to_json(&self) -> NodeResult<String> {
        serde_json::to_string(self).map_err(|e| NodeError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> NodeResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| NodeError::MalformedMessage(format!("Bad contract: {}", e)))
    }
}

/// Result of a processed contract, sent back to the contract's group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractReceipt {
    pub processor: String,
    #[serde(rename = "receiptID")]
    pub receipt_id: String,
    pub result: String,
    pub contract: Contract,
}

impl ContractReceipt {
    pub fn new(processor: impl Into<String>, result: impl Into<String>, contract: Contract) -> Self {
        Self {
            processor: processor.into(),
            receipt_id: Uuid::new_v4().to_string(),
            result: result.into(),
            contract,
        }
    }

    pub fn to_json(&self) -> NodeResult<String> {
        serde_json::to_string(self).map_err(|e| NodeError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> NodeResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| NodeError::MalformedMessage(format!("Bad receipt: {}", e)))
    }
}

/// Executes contracts for a set of operations.
pub trait ContractProcessor: Send + Sync {
    /// Operations this processor handles
    fn supported_operations(&self) -> Vec<String>;

    /// Run the contract. `None` means no result and no receipt is sent.
    fn process_contract(&self, contract: &Contract) -> Option<String>;

    fn supports(&self, operation: &str) -> bool {
        self.supported_operations().iter().any(|op| op == operation)
    }
}

/// Adds 32-bit integer arguments with wrapping. Arguments that are not
/// integers, or do not fit in an `i32`, count as 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct SumContractProcessor;

impl SumContractProcessor {
    pub const OPERATION: &'static str = "sum";
}

impl ContractProcessor for SumContractProcessor {
    fn supported_operations(&self) -> Vec<String> {
        vec![Self::OPERATION.to_string()]
    }

    fn process_contract(&self, contract: &Contract) -> Option<String> {
        if contract.operation != Self::OPERATION {
            return None;
        }
        let sum = contract
            .args
            .iter()
            .map(|arg| arg.parse::<i32>().unwrap_or(0))
            .fold(0i32, i32::wrapping_add);
        Some(sum.to_string())
    }
}
