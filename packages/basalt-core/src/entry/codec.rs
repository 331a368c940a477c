//! # Entry Codec
//!
//! Canonical byte form, content addressing, sealing and opening of entries.
//!
//! ## Canonical form
//!
//! Fixed-order concatenation of length-prefixed fields (4-byte big-endian
//! lengths): entry type, doc id, sorted dependency ids, created-at,
//! creator public key, decryption key id, original size, encrypted size,
//! content hash, and — only for the signature — the encrypted payload.
//!
//! Two derivations hang off the canonical form:
//!
//! - `id` = sha256 over the canonical metadata *without* the ciphertext.
//!   The ciphertext must stay out: a random nonce re-encryption of the
//!   same plaintext would otherwise shift the id, and identical producers
//!   are required to derive identical ids. The plaintext is pinned through
//!   `content_hash`, which is part of the metadata.
//! - `signature` = Ed25519 over the canonical form *with* the ciphertext,
//!   so nobody can splice a foreign payload under a valid id.

use crate::crypto::{self, kdf, signing, SigningKeyPair};
use crate::entry::{Entry, EntryMetadata, EntryType};
use crate::error::{Error, Result};
use crate::keybag::{self, KeyBag};

/// Everything needed to produce a signed, encrypted entry.
pub struct SealParams<'a> {
    pub entry_type: EntryType,
    pub doc_id: &'a str,
    pub plaintext: &'a [u8],
    pub dependency_ids: Vec<String>,
    /// `scope:key_id` reference into the key bag
    pub key_reference: &'a str,
    pub created_at: i64,
}

/// Serialize, encrypt, address, and sign a new entry.
///
/// Attachment chunks encrypt deterministically (nonce derived from the
/// content hash, no AAD) so identical chunks produce identical ciphertext
/// across documents. Every other type uses a random nonce with the doc id
/// as AAD, binding the payload to its document.
pub fn seal(params: SealParams<'_>, keybag: &KeyBag, signer: &SigningKeyPair) -> Result<Entry> {
    let SealParams {
        entry_type,
        doc_id,
        plaintext,
        mut dependency_ids,
        key_reference,
        created_at,
    } = params;

    if entry_type != EntryType::DocCreate && dependency_ids.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "{} entries must have at least one dependency",
            entry_type.as_str()
        )));
    }

    dependency_ids.sort();
    dependency_ids.dedup();

    let content_hash = crypto::sha256_hex(plaintext);

    let (scope, key_id) = keybag::parse_key_ref(key_reference)?;
    let key_bytes = keybag
        .get(scope, key_id)
        .ok_or_else(|| Error::MissingKey(key_reference.to_string()))?;
    let key = crypto::EncryptionKey::from_slice(&key_bytes)?;

    let encrypted_data = if entry_type == EntryType::AttachmentChunk {
        let nonce = kdf::derive_chunk_nonce(&content_hash)?;
        crypto::encrypt_with_nonce(&key, nonce, plaintext, b"")?
    } else {
        crypto::encrypt(&key, plaintext, doc_id.as_bytes())?
    };

    let created_by = signer.public_key_pem();
    let mut entry = Entry {
        id: String::new(),
        entry_type,
        doc_id: doc_id.to_string(),
        dependency_ids,
        created_at,
        created_by,
        decryption_key_id: key_reference.to_string(),
        content_hash,
        original_size: plaintext.len() as u64,
        encrypted_size: encrypted_data.len() as u64,
        signature: crypto::Signature::from_bytes([0u8; 64]),
        encrypted_data,
    };

    entry.id = compute_id(&entry.metadata());
    entry.signature = signer.sign(&signable_bytes(&entry));
    Ok(entry)
}

/// Verify an entry's integrity, signature, and (optionally) signer trust.
///
/// Checks, in order: the id matches the canonical metadata (a mismatch is
/// `Corruption` — the entry was not what its address claims), the Ed25519
/// signature verifies under `created_by`, and — when a trust provider is
/// given — the signer was trusted at the entry's `created_at`.
pub fn verify(entry: &Entry, trust: Option<&dyn crate::directory::TrustProvider>) -> Result<()> {
    let expected_id = compute_id(&entry.metadata());
    if entry.id != expected_id {
        return Err(Error::Corruption(format!(
            "entry id {} does not match its metadata",
            entry.id
        )));
    }

    signing::verify_signature(&entry.created_by, &signable_bytes(entry), &entry.signature)?;

    if let Some(trust) = trust {
        if !trust.is_trusted(&entry.created_by, entry.created_at) {
            return Err(Error::UnknownSigner(entry.created_by.clone()));
        }
    }
    Ok(())
}

/// Decrypt an entry's payload, trying every version of its named key,
/// newest first.
///
/// Returns `MissingKey` when the bag holds no version that opens the
/// payload — with rotation, a tag failure on every version means the
/// needed version is absent, not that the data is corrupt. A successful
/// decrypt whose plaintext does not match `content_hash` *is* corruption.
pub fn decrypt(entry: &Entry, keybag: &KeyBag) -> Result<Vec<u8>> {
    let (scope, key_id) = keybag::parse_key_ref(&entry.decryption_key_id)?;
    let versions = keybag.get_all_keys(scope, key_id);
    if versions.is_empty() {
        return Err(Error::MissingKey(entry.decryption_key_id.clone()));
    }

    let aad: &[u8] = if entry.entry_type == EntryType::AttachmentChunk {
        b""
    } else {
        entry.doc_id.as_bytes()
    };

    for version in &versions {
        let key = crypto::EncryptionKey::from_slice(version)?;
        if let Ok(plaintext) = crypto::decrypt(&key, &entry.encrypted_data, aad) {
            if crypto::sha256_hex(&plaintext) != entry.content_hash {
                return Err(Error::Corruption(format!(
                    "entry {} plaintext does not match its content hash",
                    entry.id
                )));
            }
            if plaintext.len() as u64 != entry.original_size {
                return Err(Error::Corruption(format!(
                    "entry {} plaintext size mismatch",
                    entry.id
                )));
            }
            return Ok(plaintext);
        }
    }

    Err(Error::MissingKey(entry.decryption_key_id.clone()))
}

/// The deterministic entry id: hex sha256 of the canonical metadata.
pub fn compute_id(metadata: &EntryMetadata) -> String {
    crypto::sha256_hex(&canonical_metadata(metadata))
}

/// Canonical metadata encoding (no signature, no ciphertext).
fn canonical_metadata(m: &EntryMetadata) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    write_field(&mut buf, m.entry_type.as_str().as_bytes());
    write_field(&mut buf, m.doc_id.as_bytes());

    let mut deps = m.dependency_ids.clone();
    deps.sort();
    buf.extend_from_slice(&(deps.len() as u32).to_be_bytes());
    for dep in &deps {
        write_field(&mut buf, dep.as_bytes());
    }

    write_field(&mut buf, &m.created_at.to_be_bytes());
    write_field(&mut buf, m.created_by.as_bytes());
    write_field(&mut buf, m.decryption_key_id.as_bytes());
    write_field(&mut buf, &m.original_size.to_be_bytes());
    write_field(&mut buf, &m.encrypted_size.to_be_bytes());
    write_field(&mut buf, m.content_hash.as_bytes());
    buf
}

/// Canonical form covered by the signature: metadata plus ciphertext.
fn signable_bytes(entry: &Entry) -> Vec<u8> {
    let mut buf = canonical_metadata(&entry.metadata());
    write_field(&mut buf, &entry.encrypted_data);
    buf
}

fn write_field(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

// ============================================================================
// TESTS
// ============================================================================
