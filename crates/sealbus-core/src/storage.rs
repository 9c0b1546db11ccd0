//! Password-protected secret container using redb.
//!
//! This module persists:
//! - Group keys (one key slot per group name)
//! - The node's signing identity
//! - The internal data-encryption key (DEK)
//! - Auxiliary keypair records (peer identity keys for handshakes)
//!
//! Key slots are sealed with a key-encryption key (KEK) derived from the
//! passphrase with Argon2id. Auxiliary records are sealed with the DEK, which
//! itself lives in a key slot. Every mutation is committed before the
//! in-memory view changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use argon2::Argon2;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crypto::{GroupCipher, GroupKey, KEY_SIZE};
use crate::error::{NodeError, NodeResult};
use crate::identity::{Identity, IdentityPublicKey, IdentitySignature};

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const KEY_SLOTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("key_slots");
const AUX_DATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("aux_data");

const META_KDF_SALT: &str = "kdf_salt";
const META_FORMAT_VERSION: &str = "format_version";
const FORMAT_VERSION: u8 = 1;
const SALT_SIZE: usize = 16;

/// Key slot alias of the internal data-encryption key
pub const DATA_ENCRYPTION_KEY_ALIAS: &str = "data_encryption_key";
/// Key slot alias of the serialized identity signing key
pub const IDENTITY_KEY_ALIAS: &str = "identity_signing_key";

/// Separator between the clear-text group name and the ciphertext on the wire
pub const GROUP_SEPARATOR: char = ',';

/// Check that `name` can be used as a group name.
///
/// Names must be non-empty, must not contain the wire separator and must not
/// collide with a reserved key slot alias.
pub fn validate_group_name(name: &str) -> NodeResult<()> {
    if name.is_empty() {
        return Err(NodeError::InvalidGroupName("empty name".to_string()));
    }
    if name.contains(GROUP_SEPARATOR) {
        return Err(NodeError::InvalidGroupName(format!(
            "'{}' contains '{}'",
            name, GROUP_SEPARATOR
        )));
    }
    if name == DATA_ENCRYPTION_KEY_ALIAS || name == IDENTITY_KEY_ALIAS {
        return Err(NodeError::InvalidGroupName(format!(
            "'{}' is a reserved alias",
            name
        )));
    }
    Ok(())
}

/// An auxiliary keypair record.
///
/// Typically holds a peer's identity public key so the handshake can verify
/// it without asking the user again. The private half is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredKeypair {
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    pub public_key: String,
}

struct StoreState {
    groups: HashMap<String, GroupKey>,
    identity: Identity,
    keypairs: HashMap<String, StoredKeypair>,
}

/// The secret container of one node.
///
/// Shared between the router and handshake tasks behind an `Arc`; mutations
/// are serialized by the internal lock.
pub struct SecretStore {
    path: PathBuf,
    db: Database,
    kek: GroupCipher,
    dek: GroupCipher,
    state: RwLock<StoreState>,
}

impl SecretStore {
    /// Create a new container at `path`, protected by `passphrase`.
    ///
    /// Generates a fresh identity and DEK. Fails if a file already exists at
    /// `path`.
    pub fn create(path: impl AsRef<Path>, passphrase: &str) -> NodeResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(NodeError::StoreFatal(format!(
                "{} already exists",
                path.display()
            )));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let mut salt = [0u8; SALT_SIZE];
        getrandom::getrandom(&mut salt)
            .map_err(|e| NodeError::StoreFatal(format!("RNG unavailable: {}", e)))?;
        let kek = GroupCipher::new(&derive_kek(passphrase, &salt)?);
        let dek_key = GroupKey::generate();
        let identity = Identity::generate();

        let write_txn = db.begin_write()?;
        {
            let mut meta = write_txn.open_table(META_TABLE)?;
            meta.insert(META_KDF_SALT, salt.as_slice())?;
            meta.insert(META_FORMAT_VERSION, [FORMAT_VERSION].as_slice())?;

            let mut slots = write_txn.open_table(KEY_SLOTS_TABLE)?;
            let sealed_dek = kek.encrypt(dek_key.as_bytes())?;
            slots.insert(DATA_ENCRYPTION_KEY_ALIAS, sealed_dek.as_slice())?;
            let sealed_identity = kek.encrypt(&identity.to_bytes())?;
            slots.insert(IDENTITY_KEY_ALIAS, sealed_identity.as_slice())?;

            let _ = write_txn.open_table(AUX_DATA_TABLE)?;
        }
        write_txn.commit()?;

        info!(
            path = %path.display(),
            identity = %identity.public_key(),
            "Created secret store"
        );

        Ok(Self {
            path: path.to_path_buf(),
            db,
            kek,
            dek: GroupCipher::new(&dek_key),
            state: RwLock::new(StoreState {
                groups: HashMap::new(),
                identity,
                keypairs: HashMap::new(),
            }),
        })
    }

    /// Open an existing container.
    ///
    /// A missing or corrupt file, or a wrong passphrase, is a
    /// [`NodeError::StoreFatal`]; nothing is partially loaded.
    pub fn open(path: impl AsRef<Path>, passphrase: &str) -> NodeResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(NodeError::StoreFatal(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let db = Database::open(path)
            .map_err(|e| NodeError::StoreFatal(format!("Cannot open container: {}", e)))?;

        let read_txn = db
            .begin_read()
            .map_err(|e| NodeError::StoreFatal(e.to_string()))?;

        let meta = read_txn
            .open_table(META_TABLE)
            .map_err(|e| NodeError::StoreFatal(format!("Missing metadata: {}", e)))?;
        let salt = meta
            .get(META_KDF_SALT)
            .map_err(|e| NodeError::StoreFatal(e.to_string()))?
            .map(|v| v.value().to_vec())
            .ok_or_else(|| NodeError::StoreFatal("Missing KDF salt".to_string()))?;
        let version = meta
            .get(META_FORMAT_VERSION)
            .map_err(|e| NodeError::StoreFatal(e.to_string()))?
            .and_then(|v| v.value().first().copied());
        if version != Some(FORMAT_VERSION) {
            return Err(NodeError::StoreFatal(format!(
                "Unsupported container format {:?}",
                version
            )));
        }

        let kek = GroupCipher::new(&derive_kek(passphrase, &salt)?);

        let slots = read_txn
            .open_table(KEY_SLOTS_TABLE)
            .map_err(|e| NodeError::StoreFatal(format!("Missing key slots: {}", e)))?;

        let mut dek_key = None;
        let mut identity = None;
        let mut groups = HashMap::new();
        for entry in slots
            .iter()
            .map_err(|e| NodeError::StoreFatal(e.to_string()))?
        {
            let (alias, sealed) = entry.map_err(|e| NodeError::StoreFatal(e.to_string()))?;
            let alias = alias.value().to_string();
            let raw = kek.decrypt(sealed.value()).map_err(|_| {
                NodeError::StoreFatal(format!(
                    "Cannot unseal key slot '{}': wrong passphrase or corrupt container",
                    alias
                ))
            })?;

            match alias.as_str() {
                DATA_ENCRYPTION_KEY_ALIAS => {
                    dek_key = Some(
                        GroupKey::from_slice(&raw)
                            .map_err(|e| NodeError::StoreFatal(e.to_string()))?,
                    );
                }
                IDENTITY_KEY_ALIAS => {
                    identity = Some(
                        Identity::from_bytes(&raw)
                            .map_err(|e| NodeError::StoreFatal(e.to_string()))?,
                    );
                }
                _ => {
                    let key = GroupKey::from_slice(&raw)
                        .map_err(|e| NodeError::StoreFatal(e.to_string()))?;
                    groups.insert(alias, key);
                }
            }
        }

        let dek_key = dek_key
            .ok_or_else(|| NodeError::StoreFatal("Missing data encryption key".to_string()))?;
        let identity =
            identity.ok_or_else(|| NodeError::StoreFatal("Missing identity key".to_string()))?;
        let dek = GroupCipher::new(&dek_key);

        let aux = read_txn
            .open_table(AUX_DATA_TABLE)
            .map_err(|e| NodeError::StoreFatal(format!("Missing auxiliary data: {}", e)))?;
        let mut keypairs = HashMap::new();
        for entry in aux.iter().map_err(|e| NodeError::StoreFatal(e.to_string()))? {
            let (alias, sealed) = entry.map_err(|e| NodeError::StoreFatal(e.to_string()))?;
            let json = dek.decrypt(sealed.value()).map_err(|_| {
                NodeError::StoreFatal(format!("Cannot unseal record '{}'", alias.value()))
            })?;
            let record: StoredKeypair = serde_json::from_slice(&json)
                .map_err(|e| NodeError::StoreFatal(format!("Corrupt record: {}", e)))?;
            keypairs.insert(alias.value().to_string(), record);
        }

        drop(slots);
        drop(aux);
        drop(meta);
        drop(read_txn);

        info!(
            path = %path.display(),
            groups = groups.len(),
            identity = %identity.public_key(),
            "Opened secret store"
        );

        Ok(Self {
            path: path.to_path_buf(),
            db,
            kek,
            dek,
            state: RwLock::new(StoreState {
                groups,
                identity,
                keypairs,
            }),
        })
    }

    /// Open `path` if it exists, otherwise create it.
    pub fn open_or_create(path: impl AsRef<Path>, passphrase: &str) -> NodeResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path, passphrase)
        } else {
            Self::create(path, passphrase)
        }
    }

    /// Location of the container file
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Group Keys
    // ═══════════════════════════════════════════════════════════════════════

    /// Generate and persist a fresh key for `name`.
    pub fn create_group(&self, name: &str) -> NodeResult<()> {
        validate_group_name(name)?;

        let mut state = self.state.write();
        if state.groups.contains_key(name) {
            return Err(NodeError::DuplicateGroup(name.to_string()));
        }

        let key = GroupKey::generate();
        self.write_slot(name, &key)?;
        state.groups.insert(name.to_string(), key);

        debug!(group = %name, "Created group key");
        Ok(())
    }

    /// Import a base64-encoded key for `name`, replacing any existing one.
    pub fn add_group(&self, name: &str, base64_key: &str) -> NodeResult<()> {
        validate_group_name(name)?;
        let key = GroupKey::from_base64(base64_key)?;

        let mut state = self.state.write();
        self.write_slot(name, &key)?;
        if state.groups.insert(name.to_string(), key).is_some() {
            warn!(group = %name, "Replaced existing group key");
        } else {
            debug!(group = %name, "Imported group key");
        }
        Ok(())
    }

    /// Delete the key for `name`. Returns whether a key was present.
    pub fn remove_group(&self, name: &str) -> NodeResult<bool> {
        let mut state = self.state.write();
        if !state.groups.contains_key(name) {
            return Ok(false);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut slots = write_txn.open_table(KEY_SLOTS_TABLE)?;
            slots.remove(name)?;
        }
        write_txn.commit()?;
        state.groups.remove(name);

        debug!(group = %name, "Removed group key");
        Ok(true)
    }

    /// Base64 export of the key for `name`
    pub fn get_key_for_group(&self, name: &str) -> Option<String> {
        self.state.read().groups.get(name).map(GroupKey::to_base64)
    }

    /// The key for `name`, if stored
    pub fn group_key(&self, name: &str) -> Option<GroupKey> {
        self.state.read().groups.get(name).cloned()
    }

    pub fn has_key_for_group(&self, name: &str) -> bool {
        self.state.read().groups.contains_key(name)
    }

    /// Names of all groups with a stored key, sorted.
    pub fn group_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().groups.keys().cloned().collect();
        names.sort();
        names
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity
    // ═══════════════════════════════════════════════════════════════════════

    pub fn identity(&self) -> Identity {
        self.state.read().identity.clone()
    }

    pub fn identity_public_key(&self) -> IdentityPublicKey {
        self.state.read().identity.public_key()
    }

    /// Hex form of the identity public key
    pub fn get_identity_public_key(&self) -> String {
        self.identity_public_key().to_hex()
    }

    /// Sign with the node identity.
    pub fn sign(&self, message: &[u8]) -> IdentitySignature {
        self.state.read().identity.sign(message)
    }

    /// Verify a signature against an arbitrary hex-encoded public key.
    ///
    /// A malformed key verifies nothing.
    pub fn verify(message: &[u8], signature: &IdentitySignature, public_key_hex: &str) -> bool {
        IdentityPublicKey::from_hex(public_key_hex)
            .map(|key| key.verify(message, signature))
            .unwrap_or(false)
    }

    /// Administrative override: install a specific private key.
    pub fn replace_identity(&self, private_key_hex: &str) -> NodeResult<IdentityPublicKey> {
        let identity = Identity::from_hex(private_key_hex)?;
        self.install_identity(identity)
    }

    /// Administrative override: replace the identity with a fresh one.
    pub fn regenerate_identity(&self) -> NodeResult<IdentityPublicKey> {
        self.install_identity(Identity::generate())
    }

    fn install_identity(&self, identity: Identity) -> NodeResult<IdentityPublicKey> {
        let mut state = self.state.write();

        let sealed = self.kek.encrypt(&identity.to_bytes())?;
        let write_txn = self.db.begin_write()?;
        {
            let mut slots = write_txn.open_table(KEY_SLOTS_TABLE)?;
            slots.insert(IDENTITY_KEY_ALIAS, sealed.as_slice())?;
        }
        write_txn.commit()?;

        let public = identity.public_key();
        warn!(
            old = %state.identity.public_key(),
            new = %public,
            "Identity replaced"
        );
        state.identity = identity;
        Ok(public)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Auxiliary Keypairs
    // ═══════════════════════════════════════════════════════════════════════

    /// Store a keypair record under `alias`, replacing any existing one.
    pub fn add_keypair(
        &self,
        alias: &str,
        private_key: Option<&str>,
        public_key: &str,
    ) -> NodeResult<()> {
        if alias.is_empty() {
            return Err(NodeError::Storage("Keypair alias is empty".to_string()));
        }

        let record = StoredKeypair {
            alias: alias.to_string(),
            private_key: private_key.map(str::to_string),
            public_key: public_key.to_string(),
        };
        let json =
            serde_json::to_vec(&record).map_err(|e| NodeError::Serialization(e.to_string()))?;
        let sealed = self.dek.encrypt(&json)?;

        let mut state = self.state.write();
        let write_txn = self.db.begin_write()?;
        {
            let mut aux = write_txn.open_table(AUX_DATA_TABLE)?;
            aux.insert(alias, sealed.as_slice())?;
        }
        write_txn.commit()?;
        state.keypairs.insert(alias.to_string(), record);

        debug!(alias = %alias, "Stored keypair");
        Ok(())
    }

    pub fn get_keypair(&self, alias: &str) -> Option<StoredKeypair> {
        self.state.read().keypairs.get(alias).cloned()
    }

    /// All keypair records, sorted by alias.
    pub fn keypairs(&self) -> Vec<StoredKeypair> {
        let mut records: Vec<StoredKeypair> =
            self.state.read().keypairs.values().cloned().collect();
        records.sort_by(|a, b| a.alias.cmp(&b.alias));
        records
    }

    /// Delete the record under `alias`. Returns whether one was present.
    pub fn remove_keypair(&self, alias: &str) -> NodeResult<bool> {
        let mut state = self.state.write();
        if !state.keypairs.contains_key(alias) {
            return Ok(false);
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut aux = write_txn.open_table(AUX_DATA_TABLE)?;
            aux.remove(alias)?;
        }
        write_txn.commit()?;
        state.keypairs.remove(alias);
        Ok(true)
    }

    fn write_slot(&self, alias: &str, key: &GroupKey) -> NodeResult<()> {
        let sealed = self.kek.encrypt(key.as_bytes())?;
        let write_txn = self.db.begin_write()?;
        {
            let mut slots = write_txn.open_table(KEY_SLOTS_TABLE)?;
            slots.insert(alias, sealed.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("path", &self.path)
            .field("groups", &self.group_names())
            .finish_non_exhaustive()
    }
}

fn derive_kek(passphrase: &str, salt: &[u8]) -> NodeResult<GroupKey> {
    let mut kek = [0u8; KEY_SIZE];
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, &mut kek)
        .map_err(|e| NodeError::StoreFatal(format!("Key derivation failed: {}", e)))?;
    Ok(GroupKey::from(kek))
}
