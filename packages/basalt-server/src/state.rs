//! Server state: the tenant registry and global configuration.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use basalt_core::{Error, Result};

use crate::tenant::{Tenant, TenantConfig};

/// Global server configuration (from CLI args / environment).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    /// Guards the admin surface when set
    pub admin_api_key: Option<String>,
    /// Unwraps per-tenant server identities for outbound sync
    pub server_key_password: Option<String>,
    pub cleanup_interval_secs: u64,
    pub peer_sync_interval_secs: u64,
}

/// Shared server state.
#[derive(Clone)]
pub struct ServerState {
    pub tenants: Arc<DashMap<String, Arc<Tenant>>>,
    pub config: Arc<ServerConfig>,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            tenants: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    /// Load every tenant directory carrying a config.json.
    pub fn load_tenants_from_disk(&self) -> Result<usize> {
        if !self.config.data_dir.is_dir() {
            return Ok(0);
        }
        let mut loaded = 0;
        for dir_entry in std::fs::read_dir(&self.config.data_dir)? {
            let path = dir_entry?.path();
            let config_path = path.join("config.json");
            if !config_path.is_file() {
                continue;
            }
            let id = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let raw = std::fs::read(&config_path)?;
            let config: TenantConfig = serde_json::from_slice(&raw)?;
            let tenant = Tenant::open(&id, &self.config.data_dir, config)?;
            self.tenants.insert(tenant.id.clone(), tenant);
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn tenant(&self, id: &str) -> Result<Arc<Tenant>> {
        self.tenants
            .get(&id.to_lowercase())
            .map(|t| t.value().clone())
            .ok_or_else(|| Error::NotFound(format!("tenant {}", id)))
    }

    /// Create and persist a tenant. Fails when the id is already taken.
    pub fn create_tenant(&self, id: &str, config: TenantConfig) -> Result<Arc<Tenant>> {
        let key = id.to_lowercase();
        if self.tenants.contains_key(&key) {
            return Err(Error::InvalidArgument(format!(
                "tenant {} already exists",
                key
            )));
        }
        let tenant = Tenant::open(&key, &self.config.data_dir, config)?;
        tenant.save_config()?;
        self.tenants.insert(key, tenant.clone());
        Ok(tenant)
    }

    /// Sweep expired auth state in every tenant.
    pub fn cleanup_expired(&self) {
        let mut removed = 0;
        for tenant in self.tenants.iter() {
            removed += tenant.auth.cleanup_expired();
        }
        if removed > 0 {
            tracing::debug!(removed, "cleaned up expired auth state");
        }
    }
}
