//! HTTP surface for VSentry.
//!
//! Two audiences share one router:
//! - Endpoint agents POST log batches to `/ingest/collect`, authenticated
//!   by bearer token through the cache-backed middleware.
//! - Admins manage ingest configs and tokens, detection rules, incidents,
//!   and playbooks under `/api/1/...`. The admin paths own the coherence
//!   contracts: token CRUD invalidates the cache, rule CRUD reloads the
//!   scheduler.

mod incidents;
mod ingest;
mod playbooks;
mod routes;
mod rules;
mod server;

use std::sync::Arc;

use tokio::sync::mpsc;

use vsentry_automation::Engine;
use vsentry_ingest::LogPayload;
use vsentry_scheduler::CronEngine;
use vsentry_store::{Store, TokenCache};

pub use server::{app, serve};

#[derive(Clone)]
pub(crate) struct ApiState {
    pub store: Arc<Store>,
    pub cache: Arc<TokenCache>,
    pub queue: mpsc::Sender<LogPayload>,
    pub scheduler: Arc<CronEngine>,
    pub automation: Arc<Engine>,
}

/// The error shape every handler returns; axum renders it as a plain-text
/// status response.
pub(crate) type ApiError = (axum::http::StatusCode, String);

pub(crate) fn internal_error<E: std::fmt::Display>(e: E) -> ApiError {
    log::error!("{e}");
    (
        axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        e.to_string(),
    )
}

pub(crate) fn not_found(what: &str, id: i64) -> ApiError {
    (
        axum::http::StatusCode::NOT_FOUND,
        format!("{what} {id} not found"),
    )
}
