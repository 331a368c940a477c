//! # Sync Peers
//!
//! The engine pulls from and pushes to a [`SyncPeer`] — it never cares
//! whether the other replica is a store in the same process or a server
//! across a transport.
//!
//! - [`LocalPeer`] wraps an [`EntryStore`] directly (tests, in-process
//!   replication, and the server's own store behind its routes).
//! - [`RemotePeer`] speaks the JSON wire protocol over an injected
//!   [`SyncTransport`], holding the bearer token from the challenge
//!   handshake and (optionally) an RSA envelope keypair.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::crypto::{EnvelopeKeyPair, SigningKeyPair};
use crate::entry::{Entry, EntryMetadata};
use crate::error::{Error, Result};
use crate::store::{EntryStore, HaveSet, ResolveOptions};
use crate::sync::transport::{
    AuthenticateRequest, AuthenticateResponse, ChallengeRequest, ChallengeResponse,
    FindNewEntriesRequest, FindNewEntriesResponse, GetEntriesRequest, GetEntriesResponse,
    HasEntriesRequest, IdListResponse, PutEntriesRequest, PutEntriesResponse,
    ResolveDependenciesRequest, SyncTransport, TransportMethod, TransportRequest,
};

/// A replica the sync engine can talk to.
#[async_trait]
pub trait SyncPeer: Send + Sync {
    async fn find_new_entries(
        &self,
        have: &HaveSet,
        doc_id: Option<&str>,
    ) -> Result<Vec<EntryMetadata>>;
    async fn get_entries(&self, ids: &[String]) -> Result<Vec<Entry>>;
    async fn put_entries(&self, entries: &[Entry]) -> Result<()>;
    async fn has_entries(&self, ids: &[String]) -> Result<Vec<String>>;
    async fn get_all_ids(&self) -> Result<Vec<String>>;
    async fn resolve_dependencies(
        &self,
        start_id: &str,
        options: &ResolveOptions,
    ) -> Result<Vec<String>>;
}

/// A peer backed by a store in the same process.
pub struct LocalPeer {
    store: Arc<dyn EntryStore>,
}

impl LocalPeer {
    pub fn new(store: Arc<dyn EntryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SyncPeer for LocalPeer {
    async fn find_new_entries(
        &self,
        have: &HaveSet,
        doc_id: Option<&str>,
    ) -> Result<Vec<EntryMetadata>> {
        match doc_id {
            Some(doc_id) => self.store.find_new_entries_for_doc(have, doc_id).await,
            None => self.store.find_new_entries(have).await,
        }
    }

    async fn get_entries(&self, ids: &[String]) -> Result<Vec<Entry>> {
        self.store.get_entries(ids).await
    }

    async fn put_entries(&self, entries: &[Entry]) -> Result<()> {
        self.store.put_entries(entries).await
    }

    async fn has_entries(&self, ids: &[String]) -> Result<Vec<String>> {
        self.store.has_entries(ids).await
    }

    async fn get_all_ids(&self) -> Result<Vec<String>> {
        self.store.get_all_ids().await
    }

    async fn resolve_dependencies(
        &self,
        start_id: &str,
        options: &ResolveOptions,
    ) -> Result<Vec<String>> {
        self.store.resolve_dependencies(start_id, options).await
    }
}

/// A peer on the other side of a transport.
pub struct RemotePeer {
    transport: Arc<dyn SyncTransport>,
    tenant_id: String,
    db_id: String,
    token: RwLock<Option<String>>,
    envelope_keys: Option<Arc<EnvelopeKeyPair>>,
}

impl RemotePeer {
    pub fn new(transport: Arc<dyn SyncTransport>, tenant_id: &str, db_id: &str) -> Self {
        Self {
            transport,
            tenant_id: tenant_id.to_string(),
            db_id: db_id.to_string(),
            token: RwLock::new(None),
            envelope_keys: None,
        }
    }

    /// Ask the server to envelope-wrap ciphertext for this keypair.
    pub fn with_envelope_keys(mut self, keys: Arc<EnvelopeKeyPair>) -> Self {
        self.envelope_keys = Some(keys);
        self
    }

    /// Run the challenge handshake and hold the resulting session token.
    pub async fn authenticate(&self, username: &str, signer: &SigningKeyPair) -> Result<()> {
        let challenge: ChallengeResponse = self
            .post(
                &format!("/{}/auth/challenge", self.tenant_id),
                &ChallengeRequest {
                    username: username.to_string(),
                },
            )
            .await?;

        let signature = signer.sign(challenge.challenge.as_bytes());
        let response: AuthenticateResponse = self
            .post(
                &format!("/{}/auth/authenticate", self.tenant_id),
                &AuthenticateRequest {
                    challenge: challenge.challenge,
                    signature_b64: BASE64.encode(signature.as_bytes()),
                },
            )
            .await?;

        match response.token {
            Some(token) if response.success => {
                *self.token.write() = Some(token);
                Ok(())
            }
            _ => Err(Error::InvalidSignature),
        }
    }

    fn sync_path(&self, operation: &str) -> String {
        format!("/{}/sync/{}", self.tenant_id, operation)
    }

    async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let body = serde_json::to_vec(body)?;
        let token = { self.token.read().clone() };
        let response = self
            .transport
            .request(TransportRequest {
                method: TransportMethod::Post,
                path: path.to_string(),
                token,
                body: Some(body),
            })
            .await?;
        Self::decode(response.status, &response.body)
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let token = { self.token.read().clone() };
        let response = self
            .transport
            .request(TransportRequest {
                method: TransportMethod::Get,
                path: path.to_string(),
                token,
                body: None,
            })
            .await?;
        Self::decode(response.status, &response.body)
    }

    fn decode<R: DeserializeOwned>(status: u16, body: &[u8]) -> Result<R> {
        let message = || String::from_utf8_lossy(body).into_owned();
        match status {
            200 => serde_json::from_slice(body)
                .map_err(|e| Error::Transport(format!("malformed peer response: {}", e))),
            400 => Err(Error::InvalidArgument(message())),
            401 => Err(Error::InvalidToken),
            403 => Err(Error::UserRevoked(message())),
            404 => Err(Error::NotFound(message())),
            other => Err(Error::Transport(format!(
                "peer returned status {}: {}",
                other,
                message()
            ))),
        }
    }
}

#[async_trait]
impl SyncPeer for RemotePeer {
    async fn find_new_entries(
        &self,
        have: &HaveSet,
        doc_id: Option<&str>,
    ) -> Result<Vec<EntryMetadata>> {
        let (have_ids, bloom) = match have {
            HaveSet::Ids(ids) => (ids.iter().cloned().collect(), None),
            HaveSet::Bloom(summary) => (Vec::new(), Some(summary.clone())),
        };
        let operation = if doc_id.is_some() {
            "findNewEntriesForDoc"
        } else {
            "findNewEntries"
        };
        let response: FindNewEntriesResponse = self
            .post(
                &self.sync_path(operation),
                &FindNewEntriesRequest {
                    db_id: self.db_id.clone(),
                    have_ids,
                    bloom,
                    doc_id: doc_id.map(String::from),
                },
            )
            .await?;
        Ok(response.entries)
    }

    async fn get_entries(&self, ids: &[String]) -> Result<Vec<Entry>> {
        let envelope_public_key_pem = match &self.envelope_keys {
            Some(keys) => Some(keys.public_key_pem()?),
            None => None,
        };
        let response: GetEntriesResponse = self
            .post(
                &self.sync_path("getEntries"),
                &GetEntriesRequest {
                    db_id: self.db_id.clone(),
                    ids: ids.to_vec(),
                    envelope_public_key_pem,
                },
            )
            .await?;
        response
            .entries
            .into_iter()
            .map(|wire| wire.open(self.envelope_keys.as_deref()))
            .collect()
    }

    async fn put_entries(&self, entries: &[Entry]) -> Result<()> {
        let response: PutEntriesResponse = self
            .post(
                &self.sync_path("putEntries"),
                &PutEntriesRequest {
                    db_id: self.db_id.clone(),
                    entries: entries.to_vec(),
                },
            )
            .await?;
        if response.success {
            Ok(())
        } else {
            Err(Error::Transport("peer rejected putEntries".into()))
        }
    }

    async fn has_entries(&self, ids: &[String]) -> Result<Vec<String>> {
        let response: IdListResponse = self
            .post(
                &self.sync_path("hasEntries"),
                &HasEntriesRequest {
                    db_id: self.db_id.clone(),
                    ids: ids.to_vec(),
                },
            )
            .await?;
        Ok(response.ids)
    }

    async fn get_all_ids(&self) -> Result<Vec<String>> {
        let path = format!("{}?dbId={}", self.sync_path("getAllIds"), self.db_id);
        let response: IdListResponse = self.get(&path).await?;
        Ok(response.ids)
    }

    async fn resolve_dependencies(
        &self,
        start_id: &str,
        options: &ResolveOptions,
    ) -> Result<Vec<String>> {
        let response: IdListResponse = self
            .post(
                &self.sync_path("resolveDependencies"),
                &ResolveDependenciesRequest {
                    db_id: self.db_id.clone(),
                    start_id: start_id.to_string(),
                    options: Some(options.clone()),
                },
            )
            .await?;
        Ok(response.ids)
    }
}
