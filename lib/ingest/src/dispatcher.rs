//! Ingest dispatcher: routes queued payloads to per-config forwarders.
//!
//! A single dispatcher task consumes the process-wide queue and a one-minute
//! reclamation timer. The worker table is read-locked on the hot path;
//! creating, restarting, or evicting a forwarder takes the write lock with
//! a double-check, since the table may have changed while waiting for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{error, info, warn};
use serde_json::Value;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, interval};

use vsentry_common::IngestCacheEntry;

use crate::forwarder::{Forwarder, compose_url};

/// One queued log batch: the resolved ingest configuration of the bearer
/// token it arrived under, plus the raw JSON body.
#[derive(Debug, Clone)]
pub struct LogPayload {
    pub config: IngestCacheEntry,
    pub data: Value,
}

/// Pipeline tuning. Production uses the defaults; tests shrink the
/// intervals to exercise eviction and flushing quickly.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        DispatcherSettings {
            queue_capacity: 10_000,
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct WorkerEntry {
    forwarder: Forwarder,
    /// Milliseconds since dispatcher start; atomic so the read-locked hot
    /// path can refresh it.
    last_seen: AtomicU64,
}

struct Inner {
    insert_url: String,
    client: reqwest::Client,
    settings: DispatcherSettings,
    workers: RwLock<HashMap<i64, WorkerEntry>>,
    epoch: Instant,
}

pub struct Dispatcher {
    inner: Arc<Inner>,
    tx: mpsc::Sender<LogPayload>,
    shutdown: broadcast::Sender<()>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn the dispatcher task. `insert_url` is the log backend's insert
    /// endpoint; stream fields are appended per payload config.
    pub fn start(insert_url: String, settings: DispatcherSettings) -> Self {
        let client = reqwest::Client::new();

        let (tx, rx) = mpsc::channel(settings.queue_capacity);
        let shutdown = broadcast::channel::<()>(1).0;

        let inner = Arc::new(Inner {
            insert_url,
            client,
            settings,
            workers: RwLock::new(HashMap::new()),
            epoch: Instant::now(),
        });

        let task = tokio::spawn(run(inner.clone(), rx, shutdown.subscribe()));
        info!("log dispatcher started");

        Self {
            inner,
            tx,
            shutdown,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    /// Producer handle for HTTP handlers. `send().await` blocks when the
    /// queue holds `queue_capacity` payloads - intentional backpressure.
    pub fn sender(&self) -> mpsc::Sender<LogPayload> {
        self.tx.clone()
    }

    /// Signal the dispatcher loop to exit, then wait while it stops every
    /// forwarder concurrently. Returns once all buffers are drained (or
    /// their final flushes have failed and been logged).
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("dispatcher task panicked: {e}");
            }
        }
    }
}

async fn run(inner: Arc<Inner>, mut rx: mpsc::Receiver<LogPayload>, mut shutdown: broadcast::Receiver<()>) {
    let mut sweep = interval(inner.settings.sweep_interval);
    sweep.tick().await; // first tick is immediate; skip it

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(payload) => process_payload(&inner, payload).await,
                None => break,
            },
            _ = sweep.tick() => clean_idle_workers(&inner).await,
            _ = shutdown.recv() => {
                // Hand already-accepted payloads to their forwarders before
                // the drain; a 202 response promised as much.
                while let Ok(payload) = rx.try_recv() {
                    process_payload(&inner, payload).await;
                }
                break;
            }
        }
    }

    stop_all_workers(&inner).await;
}

async fn process_payload(inner: &Inner, payload: LogPayload) {
    let id = payload.config.id;
    let expected = compose_url(&inner.insert_url, &payload.config.stream_fields);
    let now = clock_ms(inner);

    // Fast path: forwarder exists with the expected URL.
    {
        let workers = inner.workers.read().await;
        if let Some(entry) = workers.get(&id)
            && entry.forwarder.url() == expected
        {
            entry.last_seen.store(now, Ordering::Relaxed);
            if let Err(e) = entry.forwarder.send(payload.data).await {
                error!("{e}");
            }
            return;
        }
    }

    // Slow path: create or restart under the write lock, re-checking the
    // table state after acquisition.
    let mut workers = inner.workers.write().await;
    if let Some(entry) = workers.get(&id)
        && entry.forwarder.url() == expected
    {
        entry.last_seen.store(now, Ordering::Relaxed);
        if let Err(e) = entry.forwarder.send(payload.data).await {
            error!("{e}");
        }
        return;
    }

    if let Some(stale) = workers.remove(&id) {
        info!("config changed for ingest {id}, restarting forwarder");
        // Drains the old buffer to the old URL before the replacement
        // takes over.
        stale.forwarder.stop().await;
    }

    let forwarder = Forwarder::with_settings(
        inner.client.clone(),
        &inner.insert_url,
        &payload.config.stream_fields,
        inner.settings.batch_size,
        inner.settings.flush_interval,
    );
    info!(
        "started forwarder for ingest {id} ({})",
        payload.config.stream_fields
    );
    if let Err(e) = forwarder.send(payload.data).await {
        error!("{e}");
    }
    workers.insert(
        id,
        WorkerEntry {
            forwarder,
            last_seen: AtomicU64::new(now),
        },
    );
}

async fn clean_idle_workers(inner: &Inner) {
    let cutoff = clock_ms(inner).saturating_sub(inner.settings.idle_timeout.as_millis() as u64);
    let mut workers = inner.workers.write().await;
    let idle: Vec<i64> = workers
        .iter()
        .filter(|(_, entry)| entry.last_seen.load(Ordering::Relaxed) <= cutoff)
        .map(|(id, _)| *id)
        .collect();
    for id in idle {
        if let Some(entry) = workers.remove(&id) {
            warn!("ingest {id} idle past timeout, stopping forwarder");
            entry.forwarder.stop().await;
        }
    }
}

async fn stop_all_workers(inner: &Inner) {
    let entries: Vec<(i64, WorkerEntry)> = {
        let mut workers = inner.workers.write().await;
        workers.drain().collect()
    };

    let mut handles = Vec::with_capacity(entries.len());
    for (_, entry) in entries {
        handles.push(tokio::spawn(entry.forwarder.stop()));
    }
    for handle in handles {
        let _ = handle.await;
    }
    info!("all forwarders stopped");
}

fn clock_ms(inner: &Inner) -> u64 {
    inner.epoch.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::sync::Mutex;

    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use serde_json::json;

    /// Records every NDJSON line POSTed to it, tagged with the request URI.
    #[derive(Clone, Default)]
    struct Sink {
        lines: Arc<Mutex<Vec<(String, String)>>>,
    }

    async fn collect(
        State(sink): State<Sink>,
        uri: axum::http::Uri,
        body: String,
    ) -> StatusCode {
        let mut lines = sink.lines.lock().unwrap();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            lines.push((uri.to_string(), line.to_string()));
        }
        StatusCode::NO_CONTENT
    }

    async fn spawn_sink() -> (Sink, String) {
        let sink = Sink::default();
        let app = Router::new()
            .route("/insert/jsonline", post(collect))
            .with_state(sink.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (sink, format!("http://{addr}/insert/jsonline"))
    }

    fn settings() -> DispatcherSettings {
        DispatcherSettings {
            queue_capacity: 64,
            batch_size: 10,
            flush_interval: Duration::from_millis(50),
            idle_timeout: Duration::from_millis(200),
            sweep_interval: Duration::from_millis(50),
        }
    }

    fn payload(id: i64, fields: &str, n: u64) -> LogPayload {
        LogPayload {
            config: IngestCacheEntry {
                id,
                endpoint: String::new(),
                stream_fields: fields.to_string(),
            },
            data: json!({"seq": n}),
        }
    }

    #[tokio::test]
    async fn forwarder_preserves_send_order() {
        let (sink, url) = spawn_sink().await;
        let client = reqwest::Client::new();
        let forwarder =
            Forwarder::with_settings(client, &url, "host", 100, Duration::from_secs(30));

        for n in 0..17u64 {
            forwarder.send(json!({"seq": n})).await.unwrap();
        }
        forwarder.stop().await;

        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines.len(), 17);
        for (n, (uri, line)) in lines.iter().enumerate() {
            assert!(uri.ends_with("_stream_fields=host"), "uri: {uri}");
            let v: Value = serde_json::from_str(line).unwrap();
            assert_eq!(v["seq"], n as u64);
        }
    }

    #[tokio::test]
    async fn forwarder_flushes_on_batch_size() {
        let (sink, url) = spawn_sink().await;
        let client = reqwest::Client::new();
        // Long interval: only the size threshold can trigger the flush.
        let forwarder = Forwarder::with_settings(client, &url, "a", 3, Duration::from_secs(60));

        for n in 0..3u64 {
            forwarder.send(json!({"seq": n})).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.lines.lock().unwrap().len(), 3);
        forwarder.stop().await;
    }

    #[tokio::test]
    async fn dispatcher_routes_by_config_id() {
        let (sink, url) = spawn_sink().await;
        let dispatcher = Dispatcher::start(url, settings());
        let tx = dispatcher.sender();

        tx.send(payload(1, "host", 0)).await.unwrap();
        tx.send(payload(2, "source", 1)).await.unwrap();
        dispatcher.stop().await;

        let lines = sink.lines.lock().unwrap();
        assert_eq!(lines.len(), 2);
        let uris: Vec<&str> = lines.iter().map(|(uri, _)| uri.as_str()).collect();
        assert!(uris.iter().any(|u| u.ends_with("_stream_fields=host")));
        assert!(uris.iter().any(|u| u.ends_with("_stream_fields=source")));
    }

    #[tokio::test]
    async fn reconfiguration_restarts_the_forwarder() {
        let (sink, url) = spawn_sink().await;
        let dispatcher = Dispatcher::start(url, settings());
        let tx = dispatcher.sender();

        for n in 0..5u64 {
            tx.send(payload(5, "a", n)).await.unwrap();
        }
        // Same id, new stream fields: the composed URL changes, the old
        // forwarder drains to the old URL, a fresh one takes over.
        tx.send(payload(5, "a,b", 5)).await.unwrap();
        dispatcher.stop().await;

        let lines = sink.lines.lock().unwrap();
        let old: Vec<_> = lines
            .iter()
            .filter(|(uri, _)| uri.ends_with("_stream_fields=a"))
            .collect();
        let new: Vec<_> = lines
            .iter()
            .filter(|(uri, _)| uri.ends_with("_stream_fields=a,b"))
            .collect();
        assert_eq!(old.len(), 5);
        assert_eq!(new.len(), 1);
    }

    #[tokio::test]
    async fn idle_forwarder_is_reclaimed_and_replaced_on_next_payload() {
        let (sink, url) = spawn_sink().await;
        let dispatcher = Dispatcher::start(url, settings());
        let tx = dispatcher.sender();

        tx.send(payload(9, "x", 0)).await.unwrap();
        // Wait past idle_timeout + sweep_interval for eviction.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(dispatcher.inner.workers.read().await.is_empty());

        // Next payload for the same id starts a fresh forwarder.
        tx.send(payload(9, "x", 1)).await.unwrap();
        dispatcher.stop().await;
        assert_eq!(sink.lines.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_drains_every_forwarder() {
        let (sink, url) = spawn_sink().await;
        let mut cfg = settings();
        cfg.flush_interval = Duration::from_secs(60); // only stop() can flush
        let dispatcher = Dispatcher::start(url, cfg);
        let tx = dispatcher.sender();

        for n in 0..17u64 {
            tx.send(payload(1, "a", n)).await.unwrap();
        }
        for n in 0..4u64 {
            tx.send(payload(2, "b", n)).await.unwrap();
        }
        dispatcher.stop().await;

        assert_eq!(sink.lines.lock().unwrap().len(), 21);
    }
}
