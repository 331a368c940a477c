//! # Sync Transport
//!
//! The transport is a thin capability injected into the sync engine: it
//! moves opaque request/response bytes and nothing else. Authentication
//! state (the bearer token) is owned by the peer, not the transport;
//! HTTP specifics live entirely in the implementation.
//!
//! All bodies are JSON with byte fields base64-encoded. Requests larger
//! than [`MAX_PAYLOAD_BYTES`] are rejected by servers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::{EnvelopeKeyPair, SealedEnvelope};
use crate::entry::{Entry, EntryMetadata};
use crate::error::{Error, Result};
use crate::store::{IdBloomSummary, ResolveOptions};

/// Maximum request/response payload: 50 MB
pub const MAX_PAYLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// HTTP-shaped method of a transport request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMethod {
    Get,
    Post,
}

/// One request handed to the transport.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: TransportMethod,
    /// e.g. `/{tenant}/sync/getEntries`
    pub path: String,
    /// Bearer session token, when authenticated
    pub token: Option<String>,
    /// JSON body for POST requests
    pub body: Option<Vec<u8>>,
}

/// The transport's answer: a status code plus body bytes.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Byte-moving capability between replicas.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn request(&self, request: TransportRequest) -> Result<TransportResponse>;
}

// ============================================================================
// WIRE BODIES
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRequest {
    pub username: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    pub challenge: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    pub challenge: String,
    pub signature_b64: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindNewEntriesRequest {
    pub db_id: String,
    #[serde(default)]
    pub have_ids: Vec<String>,
    /// Bloom digest alternative to the explicit have list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bloom: Option<IdBloomSummary>,
    /// Present only on `findNewEntriesForDoc`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindNewEntriesResponse {
    pub entries: Vec<EntryMetadata>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetEntriesRequest {
    pub db_id: String,
    pub ids: Vec<String>,
    /// When present, the server wraps each entry's ciphertext in an RSA
    /// envelope for this key (defense in depth on the wire)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope_public_key_pem: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetEntriesResponse {
    pub entries: Vec<WireEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutEntriesRequest {
    pub db_id: String,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutEntriesResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HasEntriesRequest {
    pub db_id: String,
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdListResponse {
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveDependenciesRequest {
    pub db_id: String,
    pub start_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ResolveOptions>,
}

/// An entry on the wire, optionally envelope-protected.
///
/// With an envelope, `entry.encrypted_data` travels empty and the sealed
/// bytes hold the real ciphertext; [`open`](Self::open) restores the entry
/// to its signed form before any verification happens.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEntry {
    pub entry: Entry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub envelope: Option<SealedEnvelope>,
}

impl WireEntry {
    /// Ship the entry as-is.
    pub fn plain(entry: Entry) -> Self {
        Self {
            entry,
            envelope: None,
        }
    }

    /// Wrap the entry's ciphertext for the recipient's RSA key.
    pub fn sealed(mut entry: Entry, recipient_pem: &str) -> Result<Self> {
        let envelope = SealedEnvelope::seal(recipient_pem, &entry.encrypted_data)?;
        entry.encrypted_data = Vec::new();
        Ok(Self {
            entry,
            envelope: Some(envelope),
        })
    }

    /// Recover the transportable entry, unwrapping the envelope if present.
    pub fn open(self, keypair: Option<&EnvelopeKeyPair>) -> Result<Entry> {
        let Self { mut entry, envelope } = self;
        if let Some(envelope) = envelope {
            let keypair = keypair.ok_or_else(|| {
                Error::Transport("peer sent an envelope but no envelope key is configured".into())
            })?;
            entry.encrypted_data = keypair.open(&envelope)?;
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKeyPair;
    use crate::entry::codec::{seal, SealParams};
    use crate::entry::EntryType;
    use crate::keybag::{KeyBag, KeyScope};

    fn sample_entry() -> Entry {
        let mut bag = KeyBag::new();
        bag.set(KeyScope::Doc, "k", &[2u8; 32], Some(1));
        seal(
            SealParams {
                entry_type: EntryType::DocCreate,
                doc_id: "d",
                plaintext: b"{}",
                dependency_ids: vec![],
                key_reference: "doc:k",
                created_at: 42,
            },
            &bag,
            &SigningKeyPair::generate(),
        )
        .unwrap()
    }

    #[test]
    fn test_wire_bodies_use_spec_field_names() {
        let body = FindNewEntriesRequest {
            db_id: "main".into(),
            have_ids: vec!["a".into()],
            bloom: None,
            doc_id: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"dbId\""));
        assert!(json.contains("\"haveIds\""));

        let entry_json = serde_json::to_string(&sample_entry()).unwrap();
        assert!(entry_json.contains("\"entryType\""));
        assert!(entry_json.contains("\"dependencyIds\""));
        assert!(entry_json.contains("\"encryptedData\""));
    }

    #[test]
    fn test_wire_entry_plain_round_trip() {
        let entry = sample_entry();
        let wire = WireEntry::plain(entry.clone());
        let json = serde_json::to_vec(&wire).unwrap();
        let back: WireEntry = serde_json::from_slice(&json).unwrap();

        assert_eq!(back.open(None).unwrap(), entry);
    }

    #[test]
    fn test_wire_entry_envelope_round_trip() {
        use once_cell::sync::Lazy;
        static KP: Lazy<EnvelopeKeyPair> = Lazy::new(|| EnvelopeKeyPair::generate().unwrap());

        let entry = sample_entry();
        let original_ciphertext = entry.encrypted_data.clone();

        let wire = WireEntry::sealed(entry.clone(), &KP.public_key_pem().unwrap()).unwrap();
        assert!(wire.entry.encrypted_data.is_empty());

        let opened = wire.open(Some(&KP)).unwrap();
        assert_eq!(opened.encrypted_data, original_ciphertext);
        // The restored entry verifies: the envelope is outside the signature
        crate::entry::codec::verify(&opened, None).unwrap();
    }

    #[test]
    fn test_enveloped_entry_without_key_fails() {
        use once_cell::sync::Lazy;
        static KP: Lazy<EnvelopeKeyPair> = Lazy::new(|| EnvelopeKeyPair::generate().unwrap());

        let wire = WireEntry::sealed(sample_entry(), &KP.public_key_pem().unwrap()).unwrap();
        assert!(matches!(wire.open(None), Err(Error::Transport(_))));
    }
}
