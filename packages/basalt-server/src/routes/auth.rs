//! Challenge/response auth endpoints.

use axum::extract::{Path, State};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use basalt_core::crypto::Signature;
use basalt_core::sync::transport::{
    AuthenticateRequest, AuthenticateResponse, ChallengeRequest, ChallengeResponse,
};
use basalt_core::Error;

use crate::error::ApiError;
use crate::state::ServerState;

/// `POST /{tenant}/auth/challenge`
pub async fn challenge(
    State(state): State<ServerState>,
    Path(tenant_id): Path<String>,
    Json(body): Json<ChallengeRequest>,
) -> Result<Json<ChallengeResponse>, ApiError> {
    let tenant = state.tenant(&tenant_id)?;
    // Pick up grants that arrived since the last evaluation
    tenant.refresh_directory().await?;

    let challenge = tenant.auth.issue_challenge(&body.username)?;
    Ok(Json(ChallengeResponse { challenge }))
}

/// `POST /{tenant}/auth/authenticate`
///
/// A bad signature is a semantic outcome, not a transport error: the
/// response is 200 with `success: false`. Expired challenges and revoked
/// users keep their status codes.
pub async fn authenticate(
    State(state): State<ServerState>,
    Path(tenant_id): Path<String>,
    Json(body): Json<AuthenticateRequest>,
) -> Result<Json<AuthenticateResponse>, ApiError> {
    let tenant = state.tenant(&tenant_id)?;

    let raw = BASE64
        .decode(&body.signature_b64)
        .map_err(|_| Error::InvalidArgument("signature is not valid base64".into()))?;
    let signature = Signature::from_slice(&raw)
        .map_err(|_| Error::InvalidArgument("signature must be 64 bytes".into()))?;

    match tenant.auth.authenticate(&body.challenge, &signature) {
        Ok(token) => Ok(Json(AuthenticateResponse {
            success: true,
            token: Some(token),
        })),
        Err(Error::InvalidSignature) => Ok(Json(AuthenticateResponse {
            success: false,
            token: None,
        })),
        Err(e) => Err(e.into()),
    }
}
