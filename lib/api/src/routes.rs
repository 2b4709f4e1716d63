use axum::{Router, http::StatusCode, routing::get};

use crate::{ApiState, incidents, ingest, playbooks, rules};

pub(crate) fn create_router(state: ApiState) -> Router<ApiState> {
    Router::new()
        .route("/health", get(health))
        .nest("/ingest", ingest::collect_router(state))
        .nest("/api/1/ingest", ingest::admin_router())
        .nest("/api/1/rules", rules::create_router())
        .nest("/api/1/incidents", incidents::create_router())
        .nest("/api/1/playbooks", playbooks::create_router())
        .nest("/api/1/executions", playbooks::executions_router())
}

async fn health() -> StatusCode {
    StatusCode::OK
}
