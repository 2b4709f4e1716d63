//! Detection rule CRUD.
//!
//! Every create, update, and delete ends with a scheduler reload so the
//! cron table always reflects the stored rule set.

use axum::Json;
use axum::extract::{Path, State};
use axum::routing::get;
use serde_json::{Value, json};

use vsentry_common::Rule;
use vsentry_store::NewRule;

use crate::{ApiError, ApiState, internal_error, not_found};

async fn list_rules(State(state): State<ApiState>) -> Result<Json<Vec<Rule>>, ApiError> {
    Ok(Json(state.store.list_rules().map_err(internal_error)?))
}

async fn get_rule(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<Rule>, ApiError> {
    let rule = state
        .store
        .get_rule(id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("rule", id))?;
    Ok(Json(rule))
}

async fn create_rule(
    State(state): State<ApiState>,
    Json(req): Json<NewRule>,
) -> Result<Json<Rule>, ApiError> {
    let rule = state.store.create_rule(&req).map_err(internal_error)?;
    state.scheduler.reload_rules().await.map_err(internal_error)?;
    Ok(Json(rule))
}

async fn update_rule(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(req): Json<NewRule>,
) -> Result<Json<Rule>, ApiError> {
    let rule = state
        .store
        .update_rule(id, &req)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("rule", id))?;
    state.scheduler.reload_rules().await.map_err(internal_error)?;
    Ok(Json(rule))
}

async fn delete_rule(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if !state.store.delete_rule(id).map_err(internal_error)? {
        return Err(not_found("rule", id));
    }
    state.scheduler.reload_rules().await.map_err(internal_error)?;
    Ok(Json(json!({"code": 200, "msg": "deleted"})))
}

pub(crate) fn create_router() -> axum::Router<ApiState> {
    axum::Router::new()
        .route("/", get(list_rules).post(create_rule))
        .route(
            "/{id}",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
}
