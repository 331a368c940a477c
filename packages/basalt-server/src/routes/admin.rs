//! Admin surface: tenant creation and liveness.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::state::ServerState;
use crate::tenant::{StoreType, TenantConfig};

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTenantRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub admin_public_keys: Vec<String>,
    #[serde(default)]
    pub default_store: Option<StoreType>,
    #[serde(default)]
    pub directory_key_b64: Option<String>,
    #[serde(default)]
    pub trusted_peer_keys: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTenantResponse {
    pub tenant_id: String,
}

/// `POST /admin/tenants`
///
/// Guarded by `x-admin-api-key` when the server was started with
/// `ADMIN_API_KEY`. Duplicate ids answer 409.
pub async fn create_tenant(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(body): Json<CreateTenantRequest>,
) -> impl IntoResponse {
    if let Some(expected) = &state.config.admin_api_key {
        let provided = headers.get("x-admin-api-key").and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "missing or invalid admin API key" })),
            )
                .into_response();
        }
    }

    if body.tenant_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "tenantId must not be empty" })),
        )
            .into_response();
    }

    let config = TenantConfig {
        admin_public_keys: body.admin_public_keys,
        default_store: body.default_store.unwrap_or_default(),
        remote_peers: Vec::new(),
        trusted_peer_keys: body.trusted_peer_keys,
        directory_key_b64: body.directory_key_b64,
    };
    match state.create_tenant(&body.tenant_id, config) {
        Ok(tenant) => {
            tracing::info!(tenant = tenant.id.as_str(), "tenant created");
            (
                StatusCode::OK,
                Json(json!(CreateTenantResponse {
                    tenant_id: tenant.id.clone(),
                })),
            )
                .into_response()
        }
        Err(basalt_core::Error::InvalidArgument(msg)) => {
            (StatusCode::CONFLICT, Json(json!({ "error": msg }))).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
