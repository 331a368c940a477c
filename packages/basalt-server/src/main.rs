//! Basalt Sync Server
//!
//! A multi-tenant HTTP front over the Basalt entry engine:
//!
//! 1. **Auth**: challenge/response against each tenant's directory,
//!    issuing short-lived bearer session tokens.
//! 2. **Sync**: the replication endpoints (findNewEntries, getEntries,
//!    putEntries, ...) over per-tenant, per-database entry stores.
//! 3. **Relay**: the server never needs document keys — it verifies
//!    signatures and signer trust, stores ciphertext, and relays it.
//!    With peers configured, it also *pulls* from other replicas using
//!    its own encrypted identity.

mod error;
mod routes;
mod state;
mod tenant;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use basalt_core::sync::{self, RemotePeer, SyncOptions};

use state::{ServerConfig, ServerState};
use tenant::Tenant;
use transport::HttpTransport;

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "basalt-server", version, about = "Basalt multi-tenant sync server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "BASALT_PORT")]
    port: u16,

    /// Directory holding tenant configs and stores
    #[arg(long, default_value = "./data", env = "DATA_DIR")]
    data_dir: PathBuf,

    /// Protects the admin endpoints when set
    #[arg(long, env = "ADMIN_API_KEY")]
    admin_api_key: Option<String>,

    /// Password unwrapping per-tenant server identities (outbound sync)
    #[arg(long, env = "SERVER_KEY_PASSWORD")]
    server_key_password: Option<String>,

    /// Log level when RUST_LOG is unset (error|warn|info|debug|trace)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Expired challenge/session sweep interval in seconds
    #[arg(long, default_value_t = 300, env = "CLEANUP_INTERVAL_SECS")]
    cleanup_interval_secs: u64,

    /// Interval between pulls from configured remote peers
    #[arg(long, default_value_t = 60, env = "PEER_SYNC_INTERVAL_SECS")]
    peer_sync_interval_secs: u64,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing; RUST_LOG wins over --log-level
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "basalt_server={0},basalt_core={0},tower_http=info",
                    args.log_level
                ))
            }),
        )
        .init();

    let config = ServerConfig {
        port: args.port,
        data_dir: args.data_dir,
        admin_api_key: args.admin_api_key,
        server_key_password: args.server_key_password,
        cleanup_interval_secs: args.cleanup_interval_secs,
        peer_sync_interval_secs: args.peer_sync_interval_secs,
    };
    let state = ServerState::new(config);

    match state.load_tenants_from_disk() {
        Ok(0) => tracing::info!("no tenants on disk yet"),
        Ok(n) => tracing::info!(tenants = n, "loaded tenants from disk"),
        Err(e) => {
            tracing::error!(error = %e, "failed to load tenants");
            std::process::exit(1);
        }
    }

    // Spawn periodic auth-state cleanup
    let cleanup_state = state.clone();
    let cleanup_interval = state.config.cleanup_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(cleanup_interval));
        loop {
            interval.tick().await;
            cleanup_state.cleanup_expired();
        }
    });

    // Spawn the outbound peer-sync loop when an identity password exists
    if state.config.server_key_password.is_some() {
        let sync_state = state.clone();
        let sync_interval = state.config.peer_sync_interval_secs;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(sync_interval));
            loop {
                interval.tick().await;
                sync_all_peers(&sync_state).await;
            }
        });
    } else {
        tracing::info!("SERVER_KEY_PASSWORD not set; outbound peer sync disabled");
    }

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let app = routes::router(state);

    tracing::info!(%addr, "basalt-server listening");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "server exited");
    }
}

// ── Outbound Peer Sync ────────────────────────────────────────────────────────

/// Pull from every configured remote peer of every tenant.
async fn sync_all_peers(state: &ServerState) {
    let password = match &state.config.server_key_password {
        Some(p) => p.clone(),
        None => return,
    };

    let tenants: Vec<Arc<Tenant>> = state.tenants.iter().map(|t| t.value().clone()).collect();
    for tenant in tenants {
        if tenant.config.remote_peers.is_empty() {
            continue;
        }
        let identity = match tenant.load_or_create_identity(&password) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(tenant = tenant.id.as_str(), error = %e, "cannot unwrap server identity");
                continue;
            }
        };

        for peer in &tenant.config.remote_peers {
            let result = pull_from_peer(&tenant, peer, &identity).await;
            match result {
                Ok(result) if result.transferred_entries > 0 => {
                    tracing::info!(
                        tenant = tenant.id.as_str(),
                        peer = peer.url.as_str(),
                        transferred = result.transferred_entries,
                        "pulled from peer"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        tenant = tenant.id.as_str(),
                        peer = peer.url.as_str(),
                        error = %e,
                        "peer sync failed"
                    );
                }
            }
        }
    }
}

async fn pull_from_peer(
    tenant: &Tenant,
    peer: &tenant::RemotePeerConfig,
    identity: &basalt_core::crypto::SigningKeyPair,
) -> basalt_core::Result<basalt_core::SyncResult> {
    let transport = Arc::new(HttpTransport::new(&peer.url)?);
    let remote = RemotePeer::new(transport, &peer.tenant_id, &peer.db_id);
    remote.authenticate(&peer.username, identity).await?;

    let local = tenant.database(&peer.db_id)?;
    let trust = tenant.trust();
    let result = sync::pull_changes(
        local.as_ref(),
        &remote,
        Some(trust.as_ref()),
        &SyncOptions::default(),
    )
    .await?;

    if peer.db_id == tenant::DIRECTORY_DB_ID && result.transferred_entries > 0 {
        tenant.refresh_directory().await?;
    }
    Ok(result)
}
