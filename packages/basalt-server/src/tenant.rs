//! Tenant state: configuration, databases, directory, auth.
//!
//! Each tenant owns a directory on disk (id lowercased) holding a JSON
//! config, an encrypted server-identity blob, and one store file per
//! database when the file store type is selected. The tenant ↔ directory
//! construction cycle is broken with a two-phase init: databases and the
//! auth manager are wired against a deferred trust provider, and the real
//! directory is published into it once its store is open.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use basalt_core::auth::{AuthConfig, AuthManager};
use basalt_core::crypto::{self, encryption, kdf, SigningKeyPair};
use basalt_core::directory::{DeferredTrust, Directory, TrustProvider};
use basalt_core::{Error, KeyBag, KeyScope, MemoryEntryStore, Result, SqliteEntryStore};

use basalt_core::store::EntryStore;

/// The database id the directory lives under.
pub const DIRECTORY_DB_ID: &str = "directory";

/// Store backend for a tenant's databases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    #[default]
    InMemory,
    File,
}

/// A remote replica this server pulls from, acting as a sync client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePeerConfig {
    /// Base URL, e.g. `https://peer.example.com`
    pub url: String,
    /// Tenant id on the remote server
    pub tenant_id: String,
    pub db_id: String,
    /// Username this server authenticates as
    pub username: String,
}

/// Per-tenant JSON config (`<data_dir>/<tenant>/config.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConfig {
    /// Administration public keys (PEM); always trusted, and the only
    /// valid signers of grant/revoke entries
    pub admin_public_keys: Vec<String>,
    #[serde(default)]
    pub default_store: StoreType,
    #[serde(default)]
    pub remote_peers: Vec<RemotePeerConfig>,
    /// Peer server signing keys trusted for relayed entries
    #[serde(default)]
    pub trusted_peer_keys: Vec<String>,
    /// Symmetric key for directory entry payloads (base64, 32 bytes).
    /// Without it the server relays the directory but cannot evaluate it.
    #[serde(default)]
    pub directory_key_b64: Option<String>,
}

/// One tenant: config, databases, directory trust, auth state.
pub struct Tenant {
    pub id: String,
    path: PathBuf,
    pub config: TenantConfig,
    databases: DashMap<String, Arc<dyn EntryStore>>,
    pub keybag: Arc<RwLock<KeyBag>>,
    pub directory: Arc<Directory>,
    pub auth: AuthManager,
    trust: Arc<TenantTrust>,
}

impl Tenant {
    /// Open (or initialize) a tenant rooted at `<data_dir>/<id>`.
    pub fn open(id: &str, data_dir: &Path, config: TenantConfig) -> Result<Arc<Self>> {
        let id = id.to_lowercase();
        let path = data_dir.join(&id);
        std::fs::create_dir_all(&path)?;

        let mut bag = KeyBag::new();
        if let Some(encoded) = &config.directory_key_b64 {
            use base64::engine::general_purpose::STANDARD;
            use base64::Engine;
            let key = STANDARD
                .decode(encoded)
                .map_err(|_| Error::Corruption("malformed directory key in config".into()))?;
            bag.set(KeyScope::Tenant, DIRECTORY_DB_ID, &key, None);
        }
        let keybag = Arc::new(RwLock::new(bag));

        // Phase one: everything below is wired against a deferred trust
        // provider, because the directory itself needs a database
        let deferred = Arc::new(DeferredTrust::new());
        let auth = AuthManager::new(deferred.clone(), AuthConfig::default());

        let databases: DashMap<String, Arc<dyn EntryStore>> = DashMap::new();
        let directory_store = make_store(config.default_store, &path, DIRECTORY_DB_ID)?;
        databases.insert(DIRECTORY_DB_ID.to_string(), directory_store.clone());

        // Phase two: open the directory over its store and publish it
        let directory = Arc::new(Directory::new(
            directory_store,
            config.admin_public_keys.clone(),
            keybag.clone(),
        ));
        let trust = Arc::new(TenantTrust {
            directory: directory.clone(),
            static_keys: config.trusted_peer_keys.clone(),
        });
        deferred.publish(trust.clone())?;

        Ok(Arc::new(Self {
            id,
            path,
            config,
            databases,
            keybag,
            directory,
            auth,
            trust,
        }))
    }

    /// Persist the tenant config next to its stores.
    pub fn save_config(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.config)?;
        std::fs::write(self.path.join("config.json"), json)?;
        Ok(())
    }

    /// Get or lazily create a database store.
    pub fn database(&self, db_id: &str) -> Result<Arc<dyn EntryStore>> {
        if let Some(store) = self.databases.get(db_id) {
            return Ok(store.value().clone());
        }
        let store = make_store(self.config.default_store, &self.path, db_id)?;
        let entry = self
            .databases
            .entry(db_id.to_string())
            .or_insert_with(|| store);
        Ok(entry.value().clone())
    }

    /// The trust provider for entry verification (directory + static
    /// peer keys).
    pub fn trust(&self) -> Arc<dyn TrustProvider> {
        self.trust.clone()
    }

    /// Rebuild the directory view (after directory writes or syncs).
    pub async fn refresh_directory(&self) -> Result<()> {
        self.directory.refresh().await
    }

    /// Unwrap (or create and wrap) the server's own signing identity.
    ///
    /// Blob layout matches the key bag export: `salt(16) ‖ iv(12) ‖
    /// ciphertext ‖ tag(16)` with a PBKDF2 key from the password; the
    /// plaintext is the Ed25519 seed.
    pub fn load_or_create_identity(&self, password: &str) -> Result<SigningKeyPair> {
        let blob_path = self.path.join("identity.blob");
        if blob_path.exists() {
            let blob = std::fs::read(&blob_path)?;
            if blob.len() < 16 + 12 + 16 {
                return Err(Error::Corruption("server identity blob too short".into()));
            }
            let salt = &blob[..16];
            let key = kdf::derive_password_key(password, salt);
            let seed = encryption::decrypt(&key, &blob[16..], b"")?;
            return SigningKeyPair::from_secret_bytes(&seed);
        }

        let identity = SigningKeyPair::generate();
        let salt = crypto::random_bytes(16);
        let key = kdf::derive_password_key(password, &salt);
        let sealed = encryption::encrypt(&key, &identity.secret_bytes(), b"")?;
        let mut blob = salt;
        blob.extend_from_slice(&sealed);
        std::fs::write(&blob_path, blob)?;
        tracing::info!(tenant = self.id.as_str(), "created server identity");
        Ok(identity)
    }
}

/// Directory-backed trust extended with statically trusted peer keys.
struct TenantTrust {
    directory: Arc<Directory>,
    static_keys: Vec<String>,
}

impl TrustProvider for TenantTrust {
    fn is_trusted(&self, public_key_pem: &str, at: i64) -> bool {
        self.static_keys.iter().any(|k| k == public_key_pem)
            || self.directory.is_trusted(public_key_pem, at)
    }

    fn keys_for_user(&self, username: &str) -> Vec<String> {
        self.directory.keys_for_user(username)
    }

    fn is_revoked(&self, username: &str) -> bool {
        self.directory.is_revoked(username)
    }
}

fn make_store(store_type: StoreType, path: &Path, db_id: &str) -> Result<Arc<dyn EntryStore>> {
    Ok(match store_type {
        StoreType::InMemory => Arc::new(MemoryEntryStore::new()),
        StoreType::File => Arc::new(SqliteEntryStore::open(
            &path.join(format!("{}.db", db_id)),
        )?),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_core::entry::EntryType;

    #[tokio::test]
    async fn test_tenant_id_lowercased_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = Tenant::open("ACME", dir.path(), TenantConfig::default()).unwrap();
        assert_eq!(tenant.id, "acme");
        assert!(dir.path().join("acme").is_dir());
    }

    #[tokio::test]
    async fn test_two_phase_init_grants_flow_into_auth() {
        let dir = tempfile::tempdir().unwrap();
        let admin = SigningKeyPair::generate();

        let mut bag_key = vec![0u8; 32];
        bag_key[0] = 7;
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;
        let config = TenantConfig {
            admin_public_keys: vec![admin.public_key_pem()],
            directory_key_b64: Some(STANDARD.encode(&bag_key)),
            ..Default::default()
        };
        let tenant = Tenant::open("acme", dir.path(), config).unwrap();

        // Before any grant the user does not resolve
        assert!(tenant.auth.issue_challenge("alice").is_err());

        let alice = SigningKeyPair::generate();
        tenant
            .directory
            .record_access_change(
                EntryType::GrantAccess,
                "alice",
                &alice.public_key_pem(),
                "tenant:directory",
                &admin,
            )
            .await
            .unwrap();

        // Challenge → sign → token, all through the published trust
        let challenge = tenant.auth.issue_challenge("alice").unwrap();
        let token = tenant
            .auth
            .authenticate(&challenge, &alice.sign(challenge.as_bytes()))
            .unwrap();
        assert_eq!(tenant.auth.validate_token(&token).unwrap(), "alice");
    }

    #[tokio::test]
    async fn test_file_store_tenant_creates_db_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = TenantConfig {
            default_store: StoreType::File,
            ..Default::default()
        };
        let tenant = Tenant::open("acme", dir.path(), config).unwrap();
        tenant.database("main").unwrap();
        assert!(dir.path().join("acme").join("main.db").is_file());
        assert!(dir.path().join("acme").join("directory.db").is_file());
    }

    #[tokio::test]
    async fn test_identity_blob_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let tenant = Tenant::open("acme", dir.path(), TenantConfig::default()).unwrap();

        let first = tenant.load_or_create_identity("hunter2").unwrap();
        let second = tenant.load_or_create_identity("hunter2").unwrap();
        assert_eq!(first.public_key_pem(), second.public_key_pem());

        // Wrong password fails to unwrap
        assert!(tenant.load_or_create_identity("wrong").is_err());
    }

    #[tokio::test]
    async fn test_static_peer_keys_are_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let peer = SigningKeyPair::generate();
        let config = TenantConfig {
            trusted_peer_keys: vec![peer.public_key_pem()],
            ..Default::default()
        };
        let tenant = Tenant::open("acme", dir.path(), config).unwrap();
        assert!(tenant.trust().is_trusted(&peer.public_key_pem(), 0));
        assert!(!tenant
            .trust()
            .is_trusted(&SigningKeyPair::generate().public_key_pem(), 0));
    }
}
