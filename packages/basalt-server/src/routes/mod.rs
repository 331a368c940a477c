//! HTTP routes: auth, sync, and the admin surface.

pub mod admin;
pub mod auth;
pub mod sync;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::ServerState;

/// Maximum request body: 50 MB, matching the sync payload ceiling.
const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Build the full application router.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(admin::health))
        .route("/admin/tenants", post(admin::create_tenant))
        .route("/:tenant/auth/challenge", post(auth::challenge))
        .route("/:tenant/auth/authenticate", post(auth::authenticate))
        .route("/:tenant/sync/findNewEntries", post(sync::find_new_entries))
        .route(
            "/:tenant/sync/findNewEntriesForDoc",
            post(sync::find_new_entries_for_doc),
        )
        .route("/:tenant/sync/getEntries", post(sync::get_entries))
        .route("/:tenant/sync/putEntries", post(sync::put_entries))
        .route("/:tenant/sync/hasEntries", post(sync::has_entries))
        .route("/:tenant/sync/getAllIds", get(sync::get_all_ids))
        .route(
            "/:tenant/sync/resolveDependencies",
            post(sync::resolve_dependencies),
        )
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod wire_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    use basalt_core::crypto::{EnvelopeKeyPair, SigningKeyPair};
    use basalt_core::entry::EntryType;
    use basalt_core::sync::{
        self, RemotePeer, SyncOptions, SyncTransport, TransportMethod, TransportRequest,
        TransportResponse,
    };
    use basalt_core::{Database, KeyBag, KeyScope, MemoryEntryStore};
    use parking_lot::RwLock;

    use crate::state::ServerConfig;
    use crate::tenant::TenantConfig;

    /// One-tenant server plus the admin key that signs directory grants.
    struct Wire {
        state: ServerState,
        admin: SigningKeyPair,
        _dir: tempfile::TempDir,
    }

    fn wire() -> Wire {
        let dir = tempfile::tempdir().unwrap();
        let admin = SigningKeyPair::generate();
        let state = ServerState::new(ServerConfig {
            port: 0,
            data_dir: dir.path().to_path_buf(),
            admin_api_key: None,
            server_key_password: None,
            cleanup_interval_secs: 300,
            peer_sync_interval_secs: 60,
        });
        state
            .create_tenant(
                "acme",
                TenantConfig {
                    admin_public_keys: vec![admin.public_key_pem()],
                    directory_key_b64: Some(BASE64.encode([3u8; 32])),
                    ..Default::default()
                },
            )
            .unwrap();
        Wire {
            state,
            admin,
            _dir: dir,
        }
    }

    async fn grant(wire: &Wire, username: &str, keypair: &SigningKeyPair) {
        wire.state
            .tenant("acme")
            .unwrap()
            .directory
            .record_access_change(
                EntryType::GrantAccess,
                username,
                &keypair.public_key_pem(),
                "tenant:directory",
                &wire.admin,
            )
            .await
            .unwrap();
    }

    /// Drives the real router in-process, one request per oneshot.
    struct LoopbackTransport {
        state: ServerState,
    }

    #[async_trait::async_trait]
    impl SyncTransport for LoopbackTransport {
        async fn request(
            &self,
            request: TransportRequest,
        ) -> basalt_core::Result<TransportResponse> {
            let mut builder = match request.method {
                TransportMethod::Get => Request::get(&request.path),
                TransportMethod::Post => Request::post(&request.path),
            }
            .header("content-type", "application/json");
            if let Some(token) = &request.token {
                builder = builder.header("authorization", format!("Bearer {}", token));
            }
            let body = match request.body {
                Some(bytes) => Body::from(bytes),
                None => Body::empty(),
            };

            let response = router(self.state.clone())
                .oneshot(builder.body(body).expect("request builds"))
                .await
                .expect("router is infallible");
            let status = response.status().as_u16();
            let bytes = response
                .into_body()
                .collect()
                .await
                .expect("body collects")
                .to_bytes();
            Ok(TransportResponse {
                status,
                body: bytes.to_vec(),
            })
        }
    }

    fn client_database(signer: &SigningKeyPair) -> Database {
        let mut bag = KeyBag::new();
        bag.set(KeyScope::Doc, "k", &[11u8; 32], Some(1));
        Database::new(
            Arc::new(MemoryEntryStore::new()),
            Arc::new(RwLock::new(bag)),
            Arc::new(SigningKeyPair::from_secret_bytes(&signer.secret_bytes()).unwrap()),
            "doc:k",
        )
    }

    #[tokio::test]
    async fn test_push_then_pull_through_the_wire() {
        let harness = wire();
        let alice = SigningKeyPair::generate();
        grant(&harness, "alice", &alice).await;

        // Alice's replica creates a document
        let writer = client_database(&alice);
        let doc_id = writer.create_document();
        writer
            .change_document(&doc_id, |doc| {
                doc.set("name", "John Doe");
                doc.set("email", "john@e.com");
                Ok(())
            })
            .await
            .unwrap();

        // Push it to the server over the wire protocol
        let transport = Arc::new(LoopbackTransport {
            state: harness.state.clone(),
        });
        let uplink = RemotePeer::new(transport.clone(), "acme", "main");
        uplink.authenticate("alice", &alice).await.unwrap();
        let pushed = writer
            .push_changes_to(&uplink, &SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(pushed.transferred_entries, 2);

        // A second replica of alice's pulls it back down, asking for the
        // RSA transport envelope
        let envelope_keys = Arc::new(EnvelopeKeyPair::generate().unwrap());
        let reader = client_database(&alice);
        let downlink = RemotePeer::new(transport, "acme", "main")
            .with_envelope_keys(envelope_keys);
        downlink.authenticate("alice", &alice).await.unwrap();
        let pulled = reader
            .pull_changes_from(&downlink, &SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(pulled.transferred_entries, 2);

        let doc = reader.get_document(&doc_id).await.unwrap();
        assert_eq!(doc.get("name").unwrap(), "John Doe");
        assert_eq!(doc.get("email").unwrap(), "john@e.com");

        // Idempotence across the wire
        let again = reader
            .pull_changes_from(&downlink, &SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(again.transferred_entries, 0);

        // Push then pull converged both stores
        assert_eq!(
            sync::push_changes(
                reader.store().as_ref(),
                &uplink,
                &SyncOptions::default()
            )
            .await
            .unwrap()
            .transferred_entries,
            0
        );
    }
}
