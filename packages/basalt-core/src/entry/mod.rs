//! # Entries
//!
//! The entry is the atomic unit of replication: immutable, signed,
//! encrypted, and content-addressed. A document is nothing but the fold of
//! its entry chain; replicas exchange entries, never documents.
//!
//! ## Anatomy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           ENTRY                                 │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  id                 sha256 of the canonical metadata            │
//! │  entry_type         doc_create / doc_change / ...               │
//! │  doc_id             owning document                             │
//! │  dependency_ids     causal parents (a DAG per doc)              │
//! │  created_at         wall clock, advisory ordering only          │
//! │  created_by         signer's Ed25519 public key (PEM)           │
//! │  decryption_key_id  names the KeyBag key for the payload        │
//! │  content_hash       sha256 of the canonical *plaintext*         │
//! │  original_size /    plaintext and ciphertext lengths            │
//! │  encrypted_size                                                 │
//! │  signature          Ed25519 over metadata + ciphertext          │
//! │  encrypted_data     iv ‖ AES-GCM ciphertext ‖ tag               │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The content hash is taken *before* encryption, so two encryptions of the
//! same plaintext — even under random nonces — still advertise the same
//! content and derive the same id. That is what lets the store deduplicate
//! and lets independent producers of identical changes converge on one
//! entry.

pub mod codec;

use serde::{Deserialize, Serialize};

use crate::crypto::Signature;
use crate::error::{Error, Result};

/// The kind of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Opens a document's DAG; the only type allowed to have no dependencies
    DocCreate,
    /// Replaces accumulated state with a full snapshot
    DocSnapshot,
    /// A CRDT change merged into the document state
    DocChange,
    /// Marks the document deleted (tombstone; the DAG keeps growing)
    DocDelete,
    /// One content-addressed attachment chunk (deterministic encryption)
    AttachmentChunk,
    /// Manifest listing an attachment's chunks; supersedes earlier
    /// manifests for the same attachment id
    AttachmentManifest,
    /// Directory: admin grants a signing key access for a username
    GrantAccess,
    /// Directory: admin revokes a signing key
    RevokeAccess,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::DocCreate => "doc_create",
            EntryType::DocSnapshot => "doc_snapshot",
            EntryType::DocChange => "doc_change",
            EntryType::DocDelete => "doc_delete",
            EntryType::AttachmentChunk => "attachment_chunk",
            EntryType::AttachmentManifest => "attachment_manifest",
            EntryType::GrantAccess => "grantaccess",
            EntryType::RevokeAccess => "revokeaccess",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "doc_create" => Ok(EntryType::DocCreate),
            "doc_snapshot" => Ok(EntryType::DocSnapshot),
            "doc_change" => Ok(EntryType::DocChange),
            "doc_delete" => Ok(EntryType::DocDelete),
            "attachment_chunk" => Ok(EntryType::AttachmentChunk),
            "attachment_manifest" => Ok(EntryType::AttachmentManifest),
            "grantaccess" => Ok(EntryType::GrantAccess),
            "revokeaccess" => Ok(EntryType::RevokeAccess),
            other => Err(Error::Corruption(format!("unknown entry type: {}", other))),
        }
    }
}

/// A complete entry, including its encrypted payload.
///
/// Equality is id equality: the id is derived from the canonical metadata,
/// so two entries with the same id are the same entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: String,
    pub entry_type: EntryType,
    pub doc_id: String,
    /// Sorted ascending; the canonical form depends on it
    pub dependency_ids: Vec<String>,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
    /// Signer's Ed25519 public key, PEM (SPKI)
    #[serde(rename = "createdByPublicKey")]
    pub created_by: String,
    /// `scope:key_id` reference into the KeyBag
    pub decryption_key_id: String,
    /// Hex sha256 of the canonical plaintext
    pub content_hash: String,
    pub original_size: u64,
    pub encrypted_size: u64,
    pub signature: Signature,
    #[serde(with = "base64_bytes")]
    pub encrypted_data: Vec<u8>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entry {}

impl Entry {
    /// The metadata-only view used by diff exchanges (no ciphertext).
    pub fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            id: self.id.clone(),
            entry_type: self.entry_type,
            doc_id: self.doc_id.clone(),
            dependency_ids: self.dependency_ids.clone(),
            created_at: self.created_at,
            created_by: self.created_by.clone(),
            decryption_key_id: self.decryption_key_id.clone(),
            content_hash: self.content_hash.clone(),
            original_size: self.original_size,
            encrypted_size: self.encrypted_size,
        }
    }
}

/// Entry metadata without the encrypted payload.
///
/// `find_new_entries` returns these so a replica can plan batches by
/// `encrypted_size` before pulling any ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    pub id: String,
    pub entry_type: EntryType,
    pub doc_id: String,
    pub dependency_ids: Vec<String>,
    pub created_at: i64,
    #[serde(rename = "createdByPublicKey")]
    pub created_by: String,
    pub decryption_key_id: String,
    pub content_hash: String,
    pub original_size: u64,
    pub encrypted_size: u64,
}

/// Serde adapter: `Vec<u8>` as base64 strings on the wire.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(&encoded).map_err(serde::de::Error::custom)
    }
}
