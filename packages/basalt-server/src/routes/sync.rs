//! Sync endpoints: the server side of the replication protocol.
//!
//! Every endpoint requires a bearer session token from the auth
//! handshake. The handlers are thin: they translate wire bodies into
//! store calls on the tenant's database and map errors to status codes.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;

use basalt_core::entry::codec;
use basalt_core::store::HaveSet;
use basalt_core::sync::transport::{
    FindNewEntriesRequest, FindNewEntriesResponse, GetEntriesRequest, GetEntriesResponse,
    HasEntriesRequest, IdListResponse, PutEntriesRequest, PutEntriesResponse,
    ResolveDependenciesRequest, WireEntry,
};
use basalt_core::{Error, Result as CoreResult};

use crate::error::ApiError;
use crate::state::ServerState;
use crate::tenant::{Tenant, DIRECTORY_DB_ID};

/// Extract and validate the bearer token; returns the username.
fn authorize(tenant: &Tenant, headers: &HeaderMap) -> CoreResult<String> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(Error::InvalidToken)?;
    tenant.auth.validate_token(token)
}

fn have_set(body: &FindNewEntriesRequest) -> HaveSet {
    match &body.bloom {
        Some(bloom) => HaveSet::Bloom(bloom.clone()),
        None => HaveSet::Ids(body.have_ids.iter().cloned().collect()),
    }
}

/// `POST /{tenant}/sync/findNewEntries`
pub async fn find_new_entries(
    State(state): State<ServerState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<FindNewEntriesRequest>,
) -> Result<Json<FindNewEntriesResponse>, ApiError> {
    let tenant = state.tenant(&tenant_id)?;
    authorize(&tenant, &headers)?;

    let store = tenant.database(&body.db_id)?;
    let entries = store.find_new_entries(&have_set(&body)).await?;
    Ok(Json(FindNewEntriesResponse { entries }))
}

/// `POST /{tenant}/sync/findNewEntriesForDoc`
pub async fn find_new_entries_for_doc(
    State(state): State<ServerState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<FindNewEntriesRequest>,
) -> Result<Json<FindNewEntriesResponse>, ApiError> {
    let tenant = state.tenant(&tenant_id)?;
    authorize(&tenant, &headers)?;

    let doc_id = body
        .doc_id
        .clone()
        .ok_or_else(|| Error::InvalidArgument("docId is required".into()))?;
    let store = tenant.database(&body.db_id)?;
    let entries = store
        .find_new_entries_for_doc(&have_set(&body), &doc_id)
        .await?;
    Ok(Json(FindNewEntriesResponse { entries }))
}

/// `POST /{tenant}/sync/getEntries`
///
/// With an envelope key in the request, each entry's ciphertext is
/// RSA-wrapped for the caller before it leaves the server.
pub async fn get_entries(
    State(state): State<ServerState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<GetEntriesRequest>,
) -> Result<Json<GetEntriesResponse>, ApiError> {
    let tenant = state.tenant(&tenant_id)?;
    authorize(&tenant, &headers)?;

    let store = tenant.database(&body.db_id)?;
    let entries = store.get_entries(&body.ids).await?;

    let entries = match &body.envelope_public_key_pem {
        Some(pem) => entries
            .into_iter()
            .map(|entry| WireEntry::sealed(entry, pem))
            .collect::<CoreResult<Vec<_>>>()?,
        None => entries.into_iter().map(WireEntry::plain).collect(),
    };
    Ok(Json(GetEntriesResponse { entries }))
}

/// `POST /{tenant}/sync/putEntries`
///
/// Entries are verified before they land: signature integrity and signer
/// trust against the directory (or the statically trusted peer keys).
pub async fn put_entries(
    State(state): State<ServerState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PutEntriesRequest>,
) -> Result<Json<PutEntriesResponse>, ApiError> {
    let tenant = state.tenant(&tenant_id)?;
    authorize(&tenant, &headers)?;
    tenant.refresh_directory().await?;

    let trust = tenant.trust();
    for entry in &body.entries {
        codec::verify(entry, Some(trust.as_ref()))?;
    }

    let store = tenant.database(&body.db_id)?;
    store.put_entries(&body.entries).await?;

    if body.db_id == DIRECTORY_DB_ID {
        tenant.refresh_directory().await?;
    }
    Ok(Json(PutEntriesResponse { success: true }))
}

/// `POST /{tenant}/sync/hasEntries`
pub async fn has_entries(
    State(state): State<ServerState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<HasEntriesRequest>,
) -> Result<Json<IdListResponse>, ApiError> {
    let tenant = state.tenant(&tenant_id)?;
    authorize(&tenant, &headers)?;

    let store = tenant.database(&body.db_id)?;
    let ids = store.has_entries(&body.ids).await?;
    Ok(Json(IdListResponse { ids }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetAllIdsQuery {
    pub db_id: String,
}

/// `GET /{tenant}/sync/getAllIds?dbId=`
pub async fn get_all_ids(
    State(state): State<ServerState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<GetAllIdsQuery>,
) -> Result<Json<IdListResponse>, ApiError> {
    let tenant = state.tenant(&tenant_id)?;
    authorize(&tenant, &headers)?;

    let store = tenant.database(&query.db_id)?;
    let ids = store.get_all_ids().await?;
    Ok(Json(IdListResponse { ids }))
}

/// `POST /{tenant}/sync/resolveDependencies`
pub async fn resolve_dependencies(
    State(state): State<ServerState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ResolveDependenciesRequest>,
) -> Result<Json<IdListResponse>, ApiError> {
    let tenant = state.tenant(&tenant_id)?;
    authorize(&tenant, &headers)?;

    let store = tenant.database(&body.db_id)?;
    let ids = store
        .resolve_dependencies(&body.start_id, &body.options.unwrap_or_default())
        .await?;
    Ok(Json(IdListResponse { ids }))
}
