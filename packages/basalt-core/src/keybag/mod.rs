//! # KeyBag
//!
//! Per-session store of named symmetric keys with version history.
//!
//! ## Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          KEY BAG                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │   (scope, key id) ──► [ version, version, version, ... ]        │
//! │                                                                 │
//! │   scope ∈ { doc, tenant }                                       │
//! │   version = 32 key bytes + optional created_at                  │
//! │                                                                 │
//! │   get()          → newest version                               │
//! │   get_all_keys() → every version, newest first                  │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Named keys with rotation let a document be re-keyed without rewriting
//! existing entries: old entries decrypt under old versions, new entries
//! encrypt under the newest. A replica without a given key still stores
//! and relays the ciphertext it cannot read.
//!
//! Version ordering: versions with timestamps dominate and sort by
//! `created_at`; untimestamped versions keep their insertion order among
//! themselves and sort before the earliest-timestamped version.
//!
//! ## Persistence
//!
//! `save`/`load` wrap the whole bag, and `encrypt_and_export_key` wraps a
//! single version, in the same blob layout:
//!
//! ```text
//! salt(16) || iv(12) || ciphertext || tag(16)
//! ```
//!
//! with the AES key derived from the password via PBKDF2-HMAC-SHA256.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::encryption::{self, NONCE_SIZE, TAG_SIZE};
use crate::crypto::{self, kdf};
use crate::error::{Error, Result};

/// Size of the salt field in export blobs
pub const SALT_SIZE: usize = 16;

/// Size of generated symmetric keys
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// The scope of a named key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyScope {
    /// A key protecting one document (or a set of documents sharing it)
    Doc,
    /// A tenant-wide key (directory payloads, database defaults)
    Tenant,
}

impl KeyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyScope::Doc => "doc",
            KeyScope::Tenant => "tenant",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "doc" => Ok(KeyScope::Doc),
            "tenant" => Ok(KeyScope::Tenant),
            other => Err(Error::Corruption(format!("unknown key scope: {}", other))),
        }
    }
}

/// Format the `decryption_key_id` reference embedded in entry metadata.
pub fn key_ref(scope: KeyScope, key_id: &str) -> String {
    format!("{}:{}", scope.as_str(), key_id)
}

/// Parse a `decryption_key_id` reference back into (scope, key id).
pub fn parse_key_ref(reference: &str) -> Result<(KeyScope, &str)> {
    let (scope, id) = reference
        .split_once(':')
        .ok_or_else(|| Error::Corruption(format!("malformed key reference: {}", reference)))?;
    Ok((KeyScope::parse(scope)?, id))
}

/// One version of a named key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct KeyVersion {
    key: Vec<u8>,
    #[zeroize(skip)]
    created_at: Option<i64>,
}

/// Plaintext form of a single exported key version.
#[derive(Serialize, Deserialize)]
struct ExportedKey {
    key: Vec<u8>,
    created_at: Option<i64>,
}

/// Plaintext form of the whole bag.
#[derive(Serialize, Deserialize)]
struct BagSnapshot {
    entries: Vec<(String, String, Vec<u8>, Option<i64>)>,
}

/// In-memory store of named symmetric keys with version history.
#[derive(Default)]
pub struct KeyBag {
    keys: BTreeMap<(KeyScope, String), Vec<KeyVersion>>,
}

impl KeyBag {
    /// Create an empty bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a key version.
    pub fn set(&mut self, scope: KeyScope, key_id: &str, key: &[u8], created_at: Option<i64>) {
        self.keys
            .entry((scope, key_id.to_string()))
            .or_default()
            .push(KeyVersion {
                key: key.to_vec(),
                created_at,
            });
    }

    /// Get the newest version of a key, or `None` if absent.
    pub fn get(&self, scope: KeyScope, key_id: &str) -> Option<Vec<u8>> {
        self.ordered_versions(scope, key_id)
            .and_then(|versions| versions.last().map(|v| v.key.clone()))
    }

    /// Get every version of a key, newest first.
    pub fn get_all_keys(&self, scope: KeyScope, key_id: &str) -> Vec<Vec<u8>> {
        match self.ordered_versions(scope, key_id) {
            Some(versions) => versions.iter().rev().map(|v| v.key.clone()).collect(),
            None => Vec::new(),
        }
    }

    /// Versions in effective age order (oldest first): untimestamped in
    /// insertion order, then timestamped ascending by `created_at`.
    fn ordered_versions(&self, scope: KeyScope, key_id: &str) -> Option<Vec<&KeyVersion>> {
        let versions = self.keys.get(&(scope, key_id.to_string()))?;
        if versions.is_empty() {
            return None;
        }
        let mut ordered: Vec<&KeyVersion> =
            versions.iter().filter(|v| v.created_at.is_none()).collect();
        let mut timestamped: Vec<&KeyVersion> =
            versions.iter().filter(|v| v.created_at.is_some()).collect();
        timestamped.sort_by_key(|v| v.created_at);
        ordered.extend(timestamped);
        Some(ordered)
    }

    /// Generate a fresh 32-byte doc-scoped key and store it.
    pub fn create_doc_key(&mut self, key_id: &str) -> Vec<u8> {
        let key = crypto::random_bytes(SYMMETRIC_KEY_SIZE);
        self.set(KeyScope::Doc, key_id, &key, Some(crate::time::now_timestamp_millis()));
        key
    }

    /// Generate a fresh 32-byte tenant-scoped key and store it.
    pub fn create_tenant_key(&mut self, key_id: &str) -> Vec<u8> {
        let key = crypto::random_bytes(SYMMETRIC_KEY_SIZE);
        self.set(KeyScope::Tenant, key_id, &key, Some(crate::time::now_timestamp_millis()));
        key
    }

    /// Remove all versions of a key. Returns whether anything was removed.
    pub fn delete_key(&mut self, scope: KeyScope, key_id: &str) -> bool {
        self.keys.remove(&(scope, key_id.to_string())).is_some()
    }

    /// List all key references as `scope:key_id`, in stable order.
    pub fn list_keys(&self) -> Vec<String> {
        self.keys
            .keys()
            .map(|(scope, id)| key_ref(*scope, id))
            .collect()
    }

    // ========================================================================
    // SINGLE-KEY EXPORT
    // ========================================================================

    /// Export the newest version of a key, wrapped with a password.
    ///
    /// The salt field is derived from the key id, so re-exporting the same
    /// key under the same password derives the same wrapping key.
    pub fn encrypt_and_export_key(
        &self,
        scope: KeyScope,
        key_id: &str,
        password: &str,
    ) -> Result<Option<Vec<u8>>> {
        let versions = match self.ordered_versions(scope, key_id) {
            Some(v) => v,
            None => return Ok(None),
        };
        let newest = versions.last().expect("ordered_versions never returns empty");

        let plaintext = bincode::serialize(&ExportedKey {
            key: newest.key.clone(),
            created_at: newest.created_at,
        })?;

        let salt = key_salt(key_id);
        Ok(Some(seal_blob(&plaintext, password, &salt)?))
    }

    /// Verify and import a password-wrapped key version exported by
    /// [`encrypt_and_export_key`]. Preserves `created_at`.
    pub fn decrypt_and_import_key(
        &mut self,
        scope: KeyScope,
        key_id: &str,
        blob: &[u8],
        password: &str,
    ) -> Result<()> {
        let (salt, plaintext) = open_blob(blob, password)?;
        if salt != key_salt(key_id) {
            return Err(Error::Corruption("export blob salt does not match key id".into()));
        }
        let exported: ExportedKey = bincode::deserialize(&plaintext)?;
        self.set(scope, key_id, &exported.key, exported.created_at);
        Ok(())
    }

    // ========================================================================
    // WHOLE-BAG PERSISTENCE
    // ========================================================================

    /// Serialize and encrypt the whole bag under a password.
    pub fn save(&self, password: &str) -> Result<Vec<u8>> {
        let entries = self
            .keys
            .iter()
            .flat_map(|((scope, id), versions)| {
                versions.iter().map(move |v| {
                    (
                        scope.as_str().to_string(),
                        id.clone(),
                        v.key.clone(),
                        v.created_at,
                    )
                })
            })
            .collect();
        let plaintext = bincode::serialize(&BagSnapshot { entries })?;
        let salt = crypto::random_bytes(SALT_SIZE);
        seal_blob(&plaintext, password, &salt)
    }

    /// Decrypt and load a bag previously produced by [`save`](Self::save).
    pub fn load(blob: &[u8], password: &str) -> Result<Self> {
        let (_salt, plaintext) = open_blob(blob, password)?;
        let snapshot: BagSnapshot = bincode::deserialize(&plaintext)?;

        let mut bag = Self::new();
        for (scope, id, key, created_at) in snapshot.entries {
            bag.set(KeyScope::parse(&scope)?, &id, &key, created_at);
        }
        Ok(bag)
    }
}

/// Deterministic 16-byte salt for single-key exports.
fn key_salt(key_id: &str) -> Vec<u8> {
    use sha2::{Digest, Sha256};
    Sha256::digest(key_id.as_bytes())[..SALT_SIZE].to_vec()
}

/// Assemble `salt(16) || iv(12) || ciphertext || tag(16)`.
fn seal_blob(plaintext: &[u8], password: &str, salt: &[u8]) -> Result<Vec<u8>> {
    let key = kdf::derive_password_key(password, salt);
    let sealed = encryption::encrypt(&key, plaintext, b"")?;

    let mut blob = Vec::with_capacity(SALT_SIZE + sealed.len());
    blob.extend_from_slice(salt);
    blob.extend_from_slice(&sealed);
    Ok(blob)
}

/// Split and decrypt a blob assembled by [`seal_blob`].
fn open_blob(blob: &[u8], password: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    // The part after the salt must hold at least an iv and a tag
    if blob.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
        return Err(Error::Corruption(format!(
            "key blob too short: {} bytes",
            blob.len()
        )));
    }
    let salt = blob[..SALT_SIZE].to_vec();
    let key = kdf::derive_password_key(password, &salt);
    let plaintext = encryption::decrypt(&key, &blob[SALT_SIZE..], b"")?;
    Ok((salt, plaintext))
}

// ============================================================================
// TESTS
// ============================================================================
