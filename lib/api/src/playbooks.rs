//! Playbook CRUD, manual runs, and execution history.
//!
//! Manual runs pass the caller's context straight into the engine; the
//! returned execution id can be polled on the executions endpoints for
//! live per-node logs.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use vsentry_automation::dispatch_manual;
use vsentry_common::{Playbook, PlaybookExecution};
use vsentry_store::NewPlaybook;

use crate::{ApiError, ApiState, internal_error, not_found};

async fn list_playbooks(State(state): State<ApiState>) -> Result<Json<Vec<Playbook>>, ApiError> {
    Ok(Json(state.store.list_playbooks().map_err(internal_error)?))
}

async fn get_playbook(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let playbook = state
        .store
        .get_playbook(id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("playbook", id))?;
    let rule_ids = state.store.rules_for_playbook(id).map_err(internal_error)?;
    Ok(Json(json!({"playbook": playbook, "rule_ids": rule_ids})))
}

async fn create_playbook(
    State(state): State<ApiState>,
    Json(req): Json<NewPlaybook>,
) -> Result<Json<Playbook>, ApiError> {
    Ok(Json(state.store.create_playbook(&req).map_err(internal_error)?))
}

async fn update_playbook(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(req): Json<NewPlaybook>,
) -> Result<Json<Playbook>, ApiError> {
    let playbook = state
        .store
        .update_playbook(id, &req)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("playbook", id))?;
    Ok(Json(playbook))
}

async fn delete_playbook(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.delete_playbook(id).map_err(internal_error)? {
        return Err(not_found("playbook", id));
    }
    Ok(Json(json!({"code": 200, "msg": "deleted"})))
}

#[derive(Deserialize, Default)]
struct RunRequest {
    #[serde(default)]
    context: Map<String, Value>,
}

/// POST /{id}/run - manual trigger with a caller-supplied context.
async fn run_playbook(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    req: Option<Json<RunRequest>>,
) -> Result<Json<Value>, ApiError> {
    let req = req.map(|Json(req)| req).unwrap_or_default();
    let execution_id = dispatch_manual(&state.automation, id, req.context)
        .await
        .map_err(|e| {
            if e.to_string().contains("not found") {
                not_found("playbook", id)
            } else {
                internal_error(e)
            }
        })?;
    Ok(Json(json!({"execution_id": execution_id})))
}

#[derive(Deserialize)]
struct ExecutionsQuery {
    playbook_id: Option<i64>,
}

async fn list_executions(
    State(state): State<ApiState>,
    Query(query): Query<ExecutionsQuery>,
) -> Result<Json<Vec<PlaybookExecution>>, ApiError> {
    Ok(Json(
        state
            .store
            .list_executions(query.playbook_id)
            .map_err(internal_error)?,
    ))
}

async fn get_execution(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<PlaybookExecution>, ApiError> {
    let execution = state
        .store
        .get_execution(id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("execution", id))?;
    Ok(Json(execution))
}

pub(crate) fn create_router() -> axum::Router<ApiState> {
    axum::Router::new()
        .route("/", get(list_playbooks).post(create_playbook))
        .route(
            "/{id}",
            get(get_playbook)
                .put(update_playbook)
                .delete(delete_playbook),
        )
        .route("/{id}/run", post(run_playbook))
}

pub(crate) fn executions_router() -> axum::Router<ApiState> {
    axum::Router::new()
        .route("/", get(list_executions))
        .route("/{id}", get(get_execution))
}
