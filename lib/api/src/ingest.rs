//! Ingest collection endpoint, token middleware, and ingest admin CRUD.
//!
//! The middleware resolves `Authorization: Bearer <token>` through the
//! sled cache first and the relational store second, writing the resolved
//! config back through on a miss. Cache read errors other than not-found
//! fall through to the relational path rather than failing the request.
//!
//! Every admin mutation of a config or token deletes the affected
//! `t:<token>` cache entries before returning, so no request can observe
//! the pre-mutation state after the admin call succeeds.

use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{get, post};
use log::{error, warn};
use serde::Deserialize;
use serde_json::{Value, json};

use vsentry_common::{IngestAuth, IngestCacheEntry, IngestConfig};
use vsentry_ingest::LogPayload;

use crate::{ApiError, ApiState, internal_error, not_found};

pub(crate) async fn auth_middleware(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_owned)
        .ok_or((StatusCode::UNAUTHORIZED, "missing bearer token".to_string()))?;

    match state.cache.get(&token) {
        Ok(Some(entry)) => {
            request.extensions_mut().insert(entry);
            return Ok(next.run(request).await);
        }
        Ok(None) => {}
        // A broken cache must not take down ingest; resolve relationally.
        Err(e) => warn!("token cache read failed: {e}"),
    }

    let auth = state
        .store
        .auth_by_token(&token)
        .map_err(internal_error)?
        .ok_or((StatusCode::UNAUTHORIZED, "invalid token".to_string()))?;
    let config = state
        .store
        .get_ingest_config(auth.ingest_id)
        .map_err(internal_error)?
        .ok_or((
            StatusCode::NOT_FOUND,
            "ingest config not found".to_string(),
        ))?;

    let entry = IngestCacheEntry {
        id: config.id,
        endpoint: config.endpoint,
        stream_fields: config.stream_fields,
    };
    if let Err(e) = state.cache.set(&token, &entry) {
        warn!("token cache write failed: {e}");
    }

    request.extensions_mut().insert(entry);
    Ok(next.run(request).await)
}

/// POST /ingest/collect - accept any JSON value and enqueue it. Blocks on
/// a full queue (backpressure) and answers 202 once the payload is owned
/// by the pipeline.
async fn collect(
    State(state): State<ApiState>,
    axum::Extension(config): axum::Extension<IngestCacheEntry>,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let data: Value = serde_json::from_slice(&body)
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid JSON".to_string()))?;

    state
        .queue
        .send(LogPayload { config, data })
        .await
        .map_err(|_| internal_error("ingest pipeline is not running"))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"code": 202, "msg": "Log accepted"})),
    ))
}

pub(crate) fn collect_router(state: ApiState) -> axum::Router<ApiState> {
    axum::Router::new()
        .route("/collect", post(collect))
        .layer(axum::middleware::from_fn_with_state(state, auth_middleware))
}

// Admin CRUD

#[derive(Deserialize)]
struct IngestConfigRequest {
    name: String,
    #[serde(default)]
    endpoint: String,
    #[serde(default)]
    stream_fields: String,
}

#[derive(Deserialize)]
struct TokenRequest {
    secret_key: String,
}

async fn list_configs(State(state): State<ApiState>) -> Result<Json<Vec<IngestConfig>>, ApiError> {
    Ok(Json(state.store.list_ingest_configs().map_err(internal_error)?))
}

async fn create_config(
    State(state): State<ApiState>,
    Json(req): Json<IngestConfigRequest>,
) -> Result<Json<IngestConfig>, ApiError> {
    let config = state
        .store
        .create_ingest_config(&req.name, &req.endpoint, &req.stream_fields)
        .map_err(internal_error)?;
    Ok(Json(config))
}

async fn update_config(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(req): Json<IngestConfigRequest>,
) -> Result<Json<Value>, ApiError> {
    // Capture the bound tokens first; their cache entries reference the
    // pre-update stream fields.
    let auths = state.store.auths_for_config(id).map_err(internal_error)?;

    let updated = state
        .store
        .update_ingest_config(id, &req.name, &req.endpoint, &req.stream_fields)
        .map_err(internal_error)?;
    if !updated {
        return Err(not_found("ingest config", id));
    }

    invalidate(&state, &auths);
    Ok(Json(json!({"code": 200, "msg": "updated"})))
}

async fn delete_config(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let removed = state.store.delete_ingest_config(id).map_err(internal_error)?;
    invalidate(&state, &removed);
    Ok(Json(json!({"code": 200, "msg": "deleted"})))
}

async fn list_tokens(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<IngestAuth>>, ApiError> {
    Ok(Json(state.store.auths_for_config(id).map_err(internal_error)?))
}

async fn create_token(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(req): Json<TokenRequest>,
) -> Result<Json<IngestAuth>, ApiError> {
    state
        .store
        .get_ingest_config(id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("ingest config", id))?;
    let auth = state
        .store
        .create_ingest_auth(id, &req.secret_key)
        .map_err(internal_error)?;
    Ok(Json(auth))
}

async fn delete_token(
    State(state): State<ApiState>,
    Path((_, token_id)): Path<(i64, i64)>,
) -> Result<Json<Value>, ApiError> {
    let removed = state
        .store
        .delete_ingest_auth(token_id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("token", token_id))?;
    invalidate(&state, std::slice::from_ref(&removed));
    Ok(Json(json!({"code": 200, "msg": "deleted"})))
}

fn invalidate(state: &ApiState, auths: &[IngestAuth]) {
    for auth in auths {
        if let Err(e) = state.cache.del(&auth.secret_key) {
            error!("failed to invalidate cached token: {e}");
        }
    }
}

pub(crate) fn admin_router() -> axum::Router<ApiState> {
    axum::Router::new()
        .route("/", get(list_configs).post(create_config))
        .route(
            "/{id}",
            axum::routing::put(update_config).delete(delete_config),
        )
        .route("/{id}/tokens", get(list_tokens).post(create_token))
        .route("/{id}/tokens/{token_id}", axum::routing::delete(delete_token))
}
