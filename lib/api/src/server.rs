//! API server assembly and lifecycle.
//!
//! # Architecture
//! - Axum for HTTP routing and middleware
//! - Tower HTTP for CORS
//! - Shared state (Arc) for the store, token cache, ingest queue,
//!   scheduler, and playbook engine

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use log::info;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;

use vsentry_automation::Engine;
use vsentry_ingest::LogPayload;
use vsentry_scheduler::CronEngine;
use vsentry_store::{Store, TokenCache};

use crate::{ApiState, routes};

/// Build the full application router. Split from [`serve`] so tests can
/// bind their own ephemeral listener.
pub fn app(
    store: Arc<Store>,
    cache: Arc<TokenCache>,
    queue: mpsc::Sender<LogPayload>,
    scheduler: Arc<CronEngine>,
    automation: Arc<Engine>,
) -> axum::Router {
    let state = ApiState {
        store,
        cache,
        queue,
        scheduler,
        automation,
    };

    routes::create_router(state.clone())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and run the API server until the shutdown signal fires.
pub async fn serve(
    address: SocketAddr,
    store: Arc<Store>,
    cache: Arc<TokenCache>,
    queue: mpsc::Sender<LogPayload>,
    scheduler: Arc<CronEngine>,
    automation: Arc<Engine>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = app(store, cache, queue, scheduler, automation);

    let listener = tokio::net::TcpListener::bind(address).await?;
    info!("API server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("API shutting down...");
        })
        .await?;
    Ok(())
}
