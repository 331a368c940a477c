//! # Cryptographic Primitives
//!
//! The crypto surface used by the entry engine:
//!
//! - [`encryption`] - AES-256-GCM authenticated encryption (entry payloads,
//!   key-bag blobs, transport envelopes)
//! - [`signing`] - Ed25519 signatures with PEM (SPKI) public keys
//! - [`asymmetric`] - RSA-OAEP-SHA256 key wrapping for the transport envelope
//! - [`kdf`] - PBKDF2 password keys and HKDF-derived deterministic nonces
//!
//! All byte-level outputs are bit-compatible across platforms; nothing in
//! here depends on OS crypto services.

pub mod asymmetric;
pub mod encryption;
pub mod kdf;
pub mod signing;

pub use asymmetric::{EnvelopeKeyPair, SealedEnvelope};
pub use encryption::{decrypt, decrypt_with_nonce, encrypt, encrypt_with_nonce, EncryptionKey, Nonce};
pub use signing::{SigningKeyPair, Signature};

use rand::RngCore;

/// Fill a buffer with cryptographically secure random bytes.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// SHA-256 of arbitrary bytes, hex-encoded.
///
/// Content hashes and entry ids are hex strings throughout the engine.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}
