//! # Directory
//!
//! The trust substrate: which signing keys are allowed to write, and for
//! which usernames.
//!
//! The directory is itself a database built on the entry engine. Access
//! changes are `grantaccess` / `revokeaccess` entries signed by an
//! administration key; the statically configured admin keys are always
//! trusted. Scanning those entries yields a per-key event timeline, so
//! trust checks are evaluated *at a point in time*: an entry written
//! before its signer was revoked stays valid.
//!
//! The tenant ↔ directory relation is cyclic at construction (the tenant
//! opens the directory database, the directory provides the trust set for
//! the tenant's databases). [`DeferredTrust`] breaks the cycle: databases
//! are constructed against an empty deferred provider, and the directory
//! is published into it once open.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::crypto::SigningKeyPair;
use crate::entry::{codec, Entry, EntryMetadata, EntryType};
use crate::error::{Error, Result};
use crate::keybag::KeyBag;
use crate::store::{EntryStore, HaveSet};

/// The capability consumed by entry verification and auth.
pub trait TrustProvider: Send + Sync {
    /// Whether the key was trusted at the given time.
    fn is_trusted(&self, public_key_pem: &str, at: i64) -> bool;

    /// The currently trusted signing keys for a username.
    fn keys_for_user(&self, username: &str) -> Vec<String>;

    /// Whether the username exists but every key is revoked.
    fn is_revoked(&self, username: &str) -> bool;
}

/// Plaintext payload of `grantaccess` / `revokeaccess` entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessChange {
    pub username: String,
    pub public_key_pem: String,
}

/// The ids in a doc's DAG no other local entry depends on. New entries
/// depend on exactly this set.
pub fn frontier_of(metadata: &[EntryMetadata]) -> Vec<String> {
    let depended: std::collections::HashSet<&str> = metadata
        .iter()
        .flat_map(|m| m.dependency_ids.iter())
        .map(|s| s.as_str())
        .collect();
    let mut frontier: Vec<String> = metadata
        .iter()
        .filter(|m| !depended.contains(m.id.as_str()))
        .map(|m| m.id.clone())
        .collect();
    frontier.sort();
    frontier
}

#[derive(Default)]
struct TrustView {
    /// public key PEM → (created_at, granted) events, sorted by time
    events: HashMap<String, Vec<(i64, bool)>>,
    /// username → public key PEMs ever mentioned
    user_keys: HashMap<String, Vec<String>>,
}

impl TrustView {
    fn latest(&self, pem: &str) -> Option<bool> {
        self.events
            .get(pem)
            .and_then(|events| events.last())
            .map(|(_, granted)| *granted)
    }

    fn status_at(&self, pem: &str, at: i64) -> Option<bool> {
        self.events.get(pem).and_then(|events| {
            events
                .iter()
                .take_while(|(ts, _)| *ts <= at)
                .last()
                .map(|(_, granted)| *granted)
        })
    }
}

/// Directory view over a store of admin-signed access entries.
pub struct Directory {
    store: Arc<dyn EntryStore>,
    admin_keys: Vec<String>,
    /// KeyBag holding the directory's symmetric key
    keybag: Arc<RwLock<KeyBag>>,
    view: RwLock<TrustView>,
}

impl Directory {
    pub fn new(
        store: Arc<dyn EntryStore>,
        admin_keys: Vec<String>,
        keybag: Arc<RwLock<KeyBag>>,
    ) -> Self {
        Self {
            store,
            admin_keys,
            keybag,
            view: RwLock::new(TrustView::default()),
        }
    }

    /// Rebuild the trust view from the store.
    ///
    /// Entries that are not signed by a configured admin key are ignored
    /// (and logged): a compromised member key must not be able to grant
    /// itself anything.
    pub async fn refresh(&self) -> Result<()> {
        let mut ids = Vec::new();
        for entry_type in [EntryType::GrantAccess, EntryType::RevokeAccess] {
            for metadata in self.store.find_entries(entry_type, None, None).await? {
                ids.push(metadata.id);
            }
        }
        let entries = self.store.get_entries(&ids).await?;

        let mut view = TrustView::default();
        for entry in &entries {
            if !self.admin_keys.contains(&entry.created_by) {
                tracing::warn!(entry = entry.id.as_str(), "access entry not signed by an admin key, ignoring");
                continue;
            }
            if codec::verify(entry, None).is_err() {
                tracing::warn!(entry = entry.id.as_str(), "access entry signature invalid, ignoring");
                continue;
            }
            let plaintext = {
                let bag = self.keybag.read();
                match codec::decrypt(entry, &bag) {
                    Ok(p) => p,
                    Err(Error::MissingKey(key)) => {
                        tracing::warn!(key = key.as_str(), "cannot decrypt access entry, ignoring");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            };
            let change: AccessChange = serde_json::from_slice(&plaintext)?;
            let granted = entry.entry_type == EntryType::GrantAccess;

            view.events
                .entry(change.public_key_pem.clone())
                .or_default()
                .push((entry.created_at, granted));
            let keys = view.user_keys.entry(change.username.clone()).or_default();
            if !keys.contains(&change.public_key_pem) {
                keys.push(change.public_key_pem.clone());
            }
        }
        for events in view.events.values_mut() {
            events.sort();
        }

        *self.view.write() = view;
        Ok(())
    }

    /// Append a grant or revoke entry for (username, key) to the directory
    /// database, signed by the given admin keypair.
    pub async fn record_access_change(
        &self,
        entry_type: EntryType,
        username: &str,
        public_key_pem: &str,
        key_reference: &str,
        admin_signer: &SigningKeyPair,
    ) -> Result<Entry> {
        if !matches!(entry_type, EntryType::GrantAccess | EntryType::RevokeAccess) {
            return Err(Error::InvalidArgument(
                "access changes must be grantaccess or revokeaccess entries".into(),
            ));
        }

        let doc_id = format!("user:{}", username);
        let existing = self
            .store
            .find_new_entries_for_doc(&HaveSet::empty(), &doc_id)
            .await?;
        let now = crate::time::now_timestamp_millis();

        let mut batch = Vec::new();
        let deps = if existing.is_empty() {
            let create = {
                let bag = self.keybag.read();
                codec::seal(
                    codec::SealParams {
                        entry_type: EntryType::DocCreate,
                        doc_id: &doc_id,
                        plaintext: b"{}",
                        dependency_ids: vec![],
                        key_reference,
                        created_at: now,
                    },
                    &bag,
                    admin_signer,
                )?
            };
            let deps = vec![create.id.clone()];
            batch.push(create);
            deps
        } else {
            frontier_of(&existing)
        };

        let change = AccessChange {
            username: username.to_string(),
            public_key_pem: public_key_pem.to_string(),
        };
        let entry = {
            let bag = self.keybag.read();
            codec::seal(
                codec::SealParams {
                    entry_type,
                    doc_id: &doc_id,
                    plaintext: &serde_json::to_vec(&change)?,
                    dependency_ids: deps,
                    key_reference,
                    created_at: now,
                },
                &bag,
                admin_signer,
            )?
        };
        batch.push(entry.clone());

        self.store.put_entries(&batch).await?;
        self.refresh().await?;
        Ok(entry)
    }
}

impl TrustProvider for Directory {
    fn is_trusted(&self, public_key_pem: &str, at: i64) -> bool {
        if self.admin_keys.iter().any(|k| k == public_key_pem) {
            return true;
        }
        self.view
            .read()
            .status_at(public_key_pem, at)
            .unwrap_or(false)
    }

    fn keys_for_user(&self, username: &str) -> Vec<String> {
        let view = self.view.read();
        view.user_keys
            .get(username)
            .into_iter()
            .flatten()
            .filter(|pem| view.latest(pem).unwrap_or(false))
            .cloned()
            .collect()
    }

    fn is_revoked(&self, username: &str) -> bool {
        let view = self.view.read();
        match view.user_keys.get(username) {
            Some(keys) if !keys.is_empty() => {
                keys.iter().all(|pem| !view.latest(pem).unwrap_or(false))
            }
            _ => false,
        }
    }
}

/// Trust provider published after construction (two-phase init).
///
/// Until [`publish`](Self::publish) is called, nothing is trusted and no
/// user resolves — databases constructed against this provider simply
/// cannot verify foreign entries yet.
#[derive(Default)]
pub struct DeferredTrust {
    inner: OnceCell<Arc<dyn TrustProvider>>,
}

impl DeferredTrust {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the real provider. Returns an error if already published.
    pub fn publish(&self, provider: Arc<dyn TrustProvider>) -> Result<()> {
        self.inner
            .set(provider)
            .map_err(|_| Error::InvalidArgument("trust provider already published".into()))
    }

    pub fn get(&self) -> Option<&Arc<dyn TrustProvider>> {
        self.inner.get()
    }
}

impl TrustProvider for DeferredTrust {
    fn is_trusted(&self, public_key_pem: &str, at: i64) -> bool {
        self.inner
            .get()
            .map(|p| p.is_trusted(public_key_pem, at))
            .unwrap_or(false)
    }

    fn keys_for_user(&self, username: &str) -> Vec<String> {
        self.inner
            .get()
            .map(|p| p.keys_for_user(username))
            .unwrap_or_default()
    }

    fn is_revoked(&self, username: &str) -> bool {
        self.inner
            .get()
            .map(|p| p.is_revoked(username))
            .unwrap_or(false)
    }
}

// ============================================================================
// TESTS
// ============================================================================
