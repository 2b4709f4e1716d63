//! Incident triage endpoints: list, detail with evidence, acknowledge,
//! resolve, assign. Resolving is the operation that closes the folding
//! target - the next evidence for the rule opens a fresh incident.

use axum::Json;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};

use vsentry_common::{Incident, IncidentStatus};

use crate::{ApiError, ApiState, internal_error, not_found};

async fn list_incidents(State(state): State<ApiState>) -> Result<Json<Vec<Incident>>, ApiError> {
    Ok(Json(state.store.list_incidents().map_err(internal_error)?))
}

/// Detail view: the incident plus its alert evidence.
async fn get_incident(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let incident = state
        .store
        .get_incident(id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("incident", id))?;
    let alerts = state.store.alerts_for_incident(id).map_err(internal_error)?;
    Ok(Json(json!({"incident": incident, "alerts": alerts})))
}

async fn acknowledge(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if !state
        .store
        .set_incident_status(id, IncidentStatus::Acknowledged, None, None)
        .map_err(internal_error)?
    {
        return Err(not_found("incident", id));
    }
    Ok(Json(json!({"code": 200, "msg": "acknowledged"})))
}

#[derive(Deserialize, Default)]
struct ResolveRequest {
    closing_classification: Option<String>,
    closing_comment: Option<String>,
}

async fn resolve(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    req: Option<Json<ResolveRequest>>,
) -> Result<Json<Value>, ApiError> {
    let req = req.map(|Json(req)| req).unwrap_or_default();
    if !state
        .store
        .set_incident_status(
            id,
            IncidentStatus::Resolved,
            req.closing_classification.as_deref(),
            req.closing_comment.as_deref(),
        )
        .map_err(internal_error)?
    {
        return Err(not_found("incident", id));
    }
    Ok(Json(json!({"code": 200, "msg": "resolved"})))
}

#[derive(Deserialize)]
struct AssignRequest {
    assignee: String,
}

async fn assign(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(req): Json<AssignRequest>,
) -> Result<Json<Value>, ApiError> {
    if !state
        .store
        .assign_incident(id, &req.assignee)
        .map_err(internal_error)?
    {
        return Err(not_found("incident", id));
    }
    Ok(Json(json!({"code": 200, "msg": "assigned"})))
}

pub(crate) fn create_router() -> axum::Router<ApiState> {
    axum::Router::new()
        .route("/", get(list_incidents))
        .route("/{id}", get(get_incident))
        .route("/{id}/acknowledge", post(acknowledge))
        .route("/{id}/resolve", post(resolve))
        .route("/{id}/assign", post(assign))
}
