//! # Encryption Module
//!
//! Provides AES-256-GCM encryption for entry payloads and key blobs.
//!
//! ## Payload layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 ENCRYPTED ENTRY PAYLOAD                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │   nonce (12 bytes) ║ ciphertext ║ auth tag (16 bytes)           │
//! │                                                                 │
//! │   Document mutations use a random nonce.                        │
//! │   Attachment chunks use a nonce derived from the content hash   │
//! │   so that identical chunks encrypt to identical bytes and       │
//! │   deduplicate across documents.                                 │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A failed authentication tag surfaces as [`Error::Corruption`]: the store
//! is content-addressed, so a tag mismatch means the blob on disk does not
//! match what was signed and appended.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce as AesNonce,
};
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

use crate::error::{Error, Result};

/// Size of the AES-GCM nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of the AES-GCM authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of the encryption key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// A nonce (number used once) for AES-GCM encryption.
///
/// Never reuse a nonce with the same key. Random nonces are safe for up to
/// 2^32 messages per key; the deterministic chunk nonce is safe because the
/// nonce is a function of the plaintext itself — equal nonce implies equal
/// plaintext implies equal ciphertext.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    /// Generate a cryptographically random nonce
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from existing bytes
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice (must be exactly 12 bytes)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; NONCE_SIZE] = slice
            .try_into()
            .map_err(|_| Error::Corruption(format!("nonce must be {} bytes", NONCE_SIZE)))?;
        Ok(Self(bytes))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// An AES-256-GCM encryption key.
///
/// Zeroized when dropped.
#[derive(Clone, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice (must be exactly 32 bytes)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE] = slice
            .try_into()
            .map_err(|_| Error::InvalidArgument(format!("key must be {} bytes", KEY_SIZE)))?;
        Ok(Self(bytes))
    }

    /// Generate a fresh random key
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub(crate) fn as_inner(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Encrypt with a specific nonce; returns `nonce || ciphertext || tag`.
///
/// Used directly for attachment chunks, where the nonce is derived from the
/// content hash to keep encryption deterministic.
pub fn encrypt_with_nonce(
    key: &EncryptionKey,
    nonce: Nonce,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| Error::InvalidArgument(format!("invalid AES key: {}", e)))?;

    let payload = Payload { msg: plaintext, aad };

    let ciphertext = cipher
        .encrypt(AesNonce::from_slice(&nonce.0), payload)
        .map_err(|e| Error::Corruption(format!("encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce.0);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Encrypt with a random nonce; returns `nonce || ciphertext || tag`.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    encrypt_with_nonce(key, Nonce::random(), plaintext, aad)
}

/// Decrypt a `nonce || ciphertext || tag` payload.
///
/// Returns `Corruption` if the payload is too short, the tag does not
/// verify, or the AAD does not match.
pub fn decrypt(key: &EncryptionKey, data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Corruption(format!(
            "encrypted payload too short: {} bytes",
            data.len()
        )));
    }
    let nonce = Nonce::from_slice(&data[..NONCE_SIZE])?;
    decrypt_with_nonce(key, &nonce, &data[NONCE_SIZE..], aad)
}

/// Decrypt a bare `ciphertext || tag` with an explicit nonce.
pub fn decrypt_with_nonce(
    key: &EncryptionKey,
    nonce: &Nonce,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(&key.0)
        .map_err(|e| Error::InvalidArgument(format!("invalid AES key: {}", e)))?;

    let payload = Payload { msg: ciphertext, aad };

    cipher
        .decrypt(AesNonce::from_slice(&nonce.0), payload)
        .map_err(|_| Error::Corruption("authentication tag mismatch".into()))
}

// ============================================================================
// TESTS
// ============================================================================
