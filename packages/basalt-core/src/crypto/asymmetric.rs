//! # Asymmetric Key Wrapping
//!
//! RSA-OAEP-SHA256 (3072-bit modulus) for the transport envelope.
//!
//! RSA never encrypts payloads directly — a 3072-bit OAEP block carries at
//! most 318 bytes, and attachment chunks run to 256 KiB. Instead the sender
//! wraps an ephemeral AES-256-GCM key for the recipient and seals the
//! payload under that key. This is an *outer* envelope protecting entry
//! ciphertext in transit; it is unrelated to the document keys in the
//! KeyBag and is stripped before signature verification.

use rsa::pkcs8::spki::der::pem::LineEnding;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::crypto::encryption::{self, EncryptionKey};
use crate::error::{Error, Result};

/// RSA modulus size in bits
pub const MODULUS_BITS: usize = 3072;

/// An RSA keypair used to receive wrapped envelope keys.
pub struct EnvelopeKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl EnvelopeKeyPair {
    /// Generate a fresh 3072-bit keypair.
    ///
    /// RSA keygen is slow (hundreds of ms); callers generate once per
    /// identity, not per message.
    pub fn generate() -> Result<Self> {
        let mut rng = rand::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, MODULUS_BITS)
            .map_err(|e| Error::InvalidArgument(format!("RSA key generation failed: {}", e)))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// The public key as a PEM (SPKI) string, shared with peers that want
    /// to envelope-protect entries sent to us.
    pub fn public_key_pem(&self) -> Result<String> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Corruption(format!("RSA public key encoding failed: {}", e)))
    }

    /// Unwrap a sealed envelope produced by [`SealedEnvelope::seal`].
    pub fn open(&self, envelope: &SealedEnvelope) -> Result<Vec<u8>> {
        let key_bytes = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), &envelope.wrapped_key)
            .map_err(|_| Error::Corruption("RSA envelope key unwrap failed".into()))?;
        let key = EncryptionKey::from_slice(&key_bytes)?;
        encryption::decrypt(&key, &envelope.sealed_data, b"")
    }
}

/// A payload sealed for a recipient's RSA public key.
///
/// `wrapped_key` is the RSA-OAEP ciphertext of an ephemeral AES-256-GCM
/// key; `sealed_data` is `nonce || ciphertext || tag` under that key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedEnvelope {
    #[serde(with = "crate::entry::base64_bytes")]
    pub wrapped_key: Vec<u8>,
    #[serde(with = "crate::entry::base64_bytes")]
    pub sealed_data: Vec<u8>,
}

impl SealedEnvelope {
    /// Seal a payload for the holder of `recipient_pem`.
    pub fn seal(recipient_pem: &str, payload: &[u8]) -> Result<Self> {
        let public_key = RsaPublicKey::from_public_key_pem(recipient_pem)
            .map_err(|e| Error::Corruption(format!("malformed RSA public key PEM: {}", e)))?;

        let ephemeral = EncryptionKey::random();
        let sealed_data = encryption::encrypt(&ephemeral, payload, b"")?;

        let mut rng = rand::rngs::OsRng;
        let wrapped_key = public_key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), ephemeral.as_inner())
            .map_err(|e| Error::Corruption(format!("RSA envelope key wrap failed: {}", e)))?;

        Ok(Self {
            wrapped_key,
            sealed_data,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Keygen dominates these tests; share one keypair.
    fn keypair() -> &'static EnvelopeKeyPair {
        use once_cell::sync::Lazy;
        static KP: Lazy<EnvelopeKeyPair> = Lazy::new(|| EnvelopeKeyPair::generate().unwrap());
        &KP
    }

    #[test]
    fn test_seal_open_round_trip() {
        let kp = keypair();
        let payload = vec![0xabu8; 4096];

        let envelope = SealedEnvelope::seal(&kp.public_key_pem().unwrap(), &payload).unwrap();
        let opened = kp.open(&envelope).unwrap();

        assert_eq!(opened, payload);
    }

    #[test]
    fn test_large_payload_beyond_raw_oaep_limit() {
        let kp = keypair();
        // Far larger than the 318-byte OAEP ceiling for a 3072-bit modulus
        let payload = vec![7u8; 300 * 1024];

        let envelope = SealedEnvelope::seal(&kp.public_key_pem().unwrap(), &payload).unwrap();
        assert_eq!(kp.open(&envelope).unwrap(), payload);
    }

    #[test]
    fn test_tampered_envelope_fails() {
        let kp = keypair();

        let mut envelope = SealedEnvelope::seal(&kp.public_key_pem().unwrap(), b"data").unwrap();
        let last = envelope.sealed_data.len() - 1;
        envelope.sealed_data[last] ^= 0xFF;

        assert!(kp.open(&envelope).is_err());
    }
}
