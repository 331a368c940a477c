//! # Digital Signatures Module
//!
//! Ed25519 signatures over the canonical byte form of entries.
//!
//! Public keys travel as PEM (SPKI) strings: they are embedded in every
//! entry's metadata, stored in tenant configs, and looked up in the
//! directory's trust set, so a printable, self-describing encoding beats
//! raw bytes everywhere the key crosses a serialization boundary.

use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{DecodePublicKey, EncodePublicKey};
use ed25519_dalek::{Signer, Verifier, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Size of an Ed25519 signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// An Ed25519 digital signature
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "signature_bytes")] pub [u8; SIGNATURE_SIZE]);

impl Signature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice (must be exactly 64 bytes)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; SIGNATURE_SIZE] = slice.try_into().map_err(|_| {
            Error::Corruption(format!(
                "signature must be {} bytes, got {}",
                SIGNATURE_SIZE,
                slice.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }
}

mod signature_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let hex_str = String::deserialize(d)?;
        let vec = hex::decode(&hex_str).map_err(serde::de::Error::custom)?;
        vec.try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))
    }
}

/// An Ed25519 signing keypair.
///
/// The private half never leaves this process; the public half is exported
/// as PEM and embedded in every entry this key signs.
pub struct SigningKeyPair {
    signing_key: ed25519_dalek::SigningKey,
}

impl SigningKeyPair {
    /// Generate a fresh keypair from OS randomness
    pub fn generate() -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct from a 32-byte secret seed
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidArgument("signing key seed must be 32 bytes".into()))?;
        Ok(Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(&seed),
        })
    }

    /// The 32-byte secret seed (for encrypted persistence)
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// The public key as a PEM (SPKI) string
    pub fn public_key_pem(&self) -> String {
        // Encoding a valid Ed25519 key to PEM cannot fail
        self.signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap_or_default()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }
}

/// Verify a signature against a PEM-encoded public key.
///
/// Returns `InvalidSignature` when the signature does not verify and
/// `Corruption` when the PEM itself is malformed.
pub fn verify_signature(public_key_pem: &str, message: &[u8], signature: &Signature) -> Result<()> {
    let key = decode_public_key_pem(public_key_pem)?;
    let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    key.verify(message, &sig).map_err(|_| Error::InvalidSignature)
}

/// Parse a PEM (SPKI) Ed25519 public key.
pub fn decode_public_key_pem(pem: &str) -> Result<VerifyingKey> {
    VerifyingKey::from_public_key_pem(pem)
        .map_err(|e| Error::Corruption(format!("malformed public key PEM: {}", e)))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let keypair = SigningKeyPair::generate();
        let message = b"entry canonical bytes";

        let sig = keypair.sign(message);
        verify_signature(&keypair.public_key_pem(), message, &sig).unwrap();
    }

    #[test]
    fn test_wrong_key_fails() {
        let alice = SigningKeyPair::generate();
        let mallory = SigningKeyPair::generate();

        let sig = mallory.sign(b"message");
        let result = verify_signature(&alice.public_key_pem(), b"message", &sig);
        assert!(matches!(result, Err(Error::InvalidSignature)));
    }

    #[test]
    fn test_tampered_message_fails() {
        let keypair = SigningKeyPair::generate();
        let sig = keypair.sign(b"original");

        let result = verify_signature(&keypair.public_key_pem(), b"tampered", &sig);
        assert!(matches!(result, Err(Error::InvalidSignature)));
    }

    #[test]
    fn test_pem_round_trip_is_stable() {
        let keypair = SigningKeyPair::generate();
        let pem = keypair.public_key_pem();

        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        decode_public_key_pem(&pem).unwrap();
        // PEM encoding of the same key is deterministic: it doubles as a
        // map key in the directory's trust set.
        assert_eq!(pem, keypair.public_key_pem());
    }

    #[test]
    fn test_seed_round_trip() {
        let keypair = SigningKeyPair::generate();
        let restored = SigningKeyPair::from_secret_bytes(&keypair.secret_bytes()).unwrap();
        assert_eq!(keypair.public_key_pem(), restored.public_key_pem());
    }

    #[test]
    fn test_signature_from_slice_rejects_bad_length() {
        assert!(Signature::from_slice(&[0u8; 63]).is_err());
        assert!(Signature::from_slice(&[0u8; 64]).is_ok());
    }
}
