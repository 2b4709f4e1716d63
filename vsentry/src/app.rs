//! Core application orchestration module.
//!
//! The App struct coordinates all VSentry subsystems:
//! - SQLite store and sled token cache
//! - Ingest dispatcher with its per-tenant batching forwarders
//! - Cron scheduler driving the rule executor
//! - Playbook engine for incident response
//! - API server for agents and the management interface
//!
//! Event flow:
//! agents → API → LogQueue → Dispatcher → forwarders → log backend
//! scheduler tick → executor → log backend query → incident folding
//!                                               → playbook dispatch

use std::sync::Arc;

use anyhow::Result;
use log::{error, info};
use tokio::sync::broadcast;

use vsentry_automation::Engine;
use vsentry_config::VSentryConfig;
use vsentry_ingest::{Dispatcher, DispatcherSettings};
use vsentry_scheduler::{CronEngine, Executor};
use vsentry_store::{Store, TokenCache};

/// Owns every long-lived subsystem and the shutdown channel that ties
/// their lifecycles together.
pub struct App {
    config: VSentryConfig,
    store: Arc<Store>,
    cache: Arc<TokenCache>,
    dispatcher: Dispatcher,
    scheduler: Arc<CronEngine>,
    automation: Arc<Engine>,
    /// Shutdown signal distributed to all spawned tasks for coordinated
    /// termination.
    shutdown: broadcast::Sender<()>,
}

impl App {
    pub async fn new(config: VSentryConfig) -> Result<Self> {
        let shutdown = broadcast::channel::<()>(1).0;

        info!("... opening store at {}", config.db.display());
        let store = Arc::new(Store::open(&config.db)?);

        info!("... opening token cache at {}", config.cache.display());
        let cache = Arc::new(TokenCache::open(&config.cache)?);

        let dispatcher = Dispatcher::start(
            config.backend.insert_url(),
            DispatcherSettings {
                queue_capacity: config.ingest.queue_capacity,
                ..DispatcherSettings::default()
            },
        );

        let automation = Arc::new(Engine::new(store.clone()));
        let executor = Arc::new(Executor::new(
            store.clone(),
            automation.clone(),
            config.backend.query_url(),
        ));
        let scheduler = Arc::new(CronEngine::new(executor));

        Ok(App {
            config,
            store,
            cache,
            dispatcher,
            scheduler,
            automation,
            shutdown,
        })
    }

    pub fn shutdown_channel(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Run until shutdown: load the schedule, serve the API, then tear
    /// down in dependency order. The dispatcher stops last so every
    /// accepted payload gets its final flush.
    pub async fn run(&self) -> Result<()> {
        info!("... loading rule schedule");
        self.scheduler.reload_rules().await?;

        info!("... starting API server");
        vsentry_api::serve(
            self.config.server.address,
            self.store.clone(),
            self.cache.clone(),
            self.dispatcher.sender(),
            self.scheduler.clone(),
            self.automation.clone(),
            self.shutdown.subscribe(),
        )
        .await?;

        // The server has stopped accepting requests; drain the pipeline.
        self.scheduler.stop().await;
        self.dispatcher.stop().await;
        if let Err(e) = self.cache.flush() {
            error!("token cache flush failed: {e}");
        }

        Ok(())
    }
}
