//! Error types for Sealbus

use thiserror::Error;

/// Main error type for Sealbus operations
#[derive(Error, Debug)]
pub enum NodeError {
    /// AEAD tag mismatch, truncated ciphertext or wrong key size.
    ///
    /// Always recoverable by dropping the offending message.
    #[error("Crypto authentication failed: {0}")]
    CryptoAuth(String),

    /// An operation referenced a group for which no key is stored
    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    /// An envelope, contract or receipt failed to parse
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// The handshake peer failed authentication (bad signature, bad key)
    #[error("Handshake authentication failed: {0}")]
    HandshakeAuth(String),

    /// The secret container is unreadable or the passphrase is wrong
    #[error("Secret store unusable: {0}")]
    StoreFatal(String),

    /// Socket or connection failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// `create_group` was called with a name that already has a key
    #[error("Group already exists: {0}")]
    DuplicateGroup(String),

    /// An imported group key did not decode to exactly 32 bytes
    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Group name is empty, reserved, or contains the wire separator
    #[error("Invalid group name: {0}")]
    InvalidGroupName(String),

    /// Identity-related error (keys, signatures)
    #[error("Identity error: {0}")]
    Identity(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Whether this error only affects a single inbound message.
    ///
    /// The router drops such messages and keeps the event loop running.
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            NodeError::CryptoAuth(_) | NodeError::UnknownGroup(_) | NodeError::MalformedMessage(_)
        )
    }
}

/// Result type alias using NodeError
pub type NodeResult<T> = Result<T, NodeError>;
