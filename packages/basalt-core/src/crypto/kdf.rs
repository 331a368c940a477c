//! # Key Derivation Functions
//!
//! Two derivations back the engine:
//!
//! - **PBKDF2-HMAC-SHA256** turns a user password into the AES key that
//!   wraps KeyBag export blobs (310 000 iterations, 32-byte output).
//! - **HKDF-SHA256** derives the deterministic attachment-chunk nonce from
//!   the chunk's content hash. Equal plaintext → equal content hash → equal
//!   nonce → equal ciphertext, which is what makes chunk deduplication work
//!   across documents. Domain-separation labels carry a version suffix so
//!   the scheme can rotate.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::crypto::encryption::{EncryptionKey, Nonce, KEY_SIZE, NONCE_SIZE};
use crate::error::{Error, Result};

/// PBKDF2 iteration count for password-derived keys
pub const PBKDF2_ITERATIONS: u32 = 310_000;

/// Domain separation labels for HKDF
mod domain {
    /// Deterministic nonce for attachment chunk encryption
    pub const CHUNK_NONCE: &[u8] = b"basalt-chunk-nonce-v1";
}

/// Derive a 32-byte AES key from a password and salt via PBKDF2-HMAC-SHA256.
pub fn derive_password_key(password: &str, salt: &[u8]) -> EncryptionKey {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    EncryptionKey::from_bytes(key)
}

/// Derive the deterministic chunk nonce from a content hash (hex string).
///
/// The content hash is already uniform, so it serves as the HKDF input key
/// material with no salt; the label separates this use from any future one.
pub fn derive_chunk_nonce(content_hash: &str) -> Result<Nonce> {
    let hkdf = Hkdf::<Sha256>::new(None, content_hash.as_bytes());
    let mut nonce = [0u8; NONCE_SIZE];
    hkdf.expand(domain::CHUNK_NONCE, &mut nonce)
        .map_err(|_| Error::Corruption("HKDF expansion failed".into()))?;
    Ok(Nonce::from_bytes(nonce))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_key_is_deterministic() {
        let a = derive_password_key("hunter2", b"0123456789abcdef");
        let b = derive_password_key("hunter2", b"0123456789abcdef");
        assert_eq!(a.as_inner(), b.as_inner());
    }

    #[test]
    fn test_password_key_varies_with_salt() {
        let a = derive_password_key("hunter2", b"salt-one--------");
        let b = derive_password_key("hunter2", b"salt-two--------");
        assert_ne!(a.as_inner(), b.as_inner());
    }

    #[test]
    fn test_chunk_nonce_is_deterministic() {
        let hash = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        let a = derive_chunk_nonce(hash).unwrap();
        let b = derive_chunk_nonce(hash).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_chunk_nonce_varies_with_hash() {
        let a = derive_chunk_nonce("aaaa").unwrap();
        let b = derive_chunk_nonce("bbbb").unwrap();
        assert_ne!(a, b);
    }
}
