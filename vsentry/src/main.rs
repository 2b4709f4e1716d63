//! VSentry - SIEM/SOAR backend daemon.
//!
//! Entry point. Responsible for:
//! - Loading configuration from file or environment variables
//! - Initializing storage, the ingest pipeline, scheduler, and API server
//! - Handling graceful shutdown via SIGINT/SIGTERM

use anyhow::Result;
use log::info;
use vsentry_config::VSentryConfig;

mod app;
use app::App;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = config()?;

    let app = App::new(config).await?;
    let shutdown = app.shutdown_channel();

    // Broadcast to all subsystems (API server, dispatcher, scheduler)
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("VSentry shutting down...");
        let _ = shutdown.send(());
    });

    println!(".:: Starting VSentry ::.");
    app.run().await?;
    println!(".:: VSentry Stopped. Goodbye ::.");

    Ok(())
}

fn config() -> Result<VSentryConfig> {
    // "vsentry" uses defaults + environment; "vsentry config.yaml" layers
    // the file underneath the environment.
    match std::env::args().nth(1) {
        Some(file) => VSentryConfig::from_file(&file),
        None => VSentryConfig::new(),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            log::error!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
