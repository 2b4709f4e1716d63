//! Batching NDJSON forwarder for one ingest configuration.
//!
//! Each forwarder owns a private bounded channel and a buffer. A dedicated
//! worker drains the channel and flushes the buffer to the log backend
//! when it reaches the batch size or the flush interval elapses. Events
//! sent on one forwarder are flushed in send order.
//!
//! # Delivery
//! A non-2xx flush is counted and logged, not retried: collectors keep a
//! local disk spool and the next batch re-covers transient backend
//! outages.

use anyhow::{Result, anyhow};
use log::{debug, error, info};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};

const CHANNEL_CAPACITY: usize = 2_000;

/// Per-flush request deadline.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Forwarder {
    url: String,
    tx: mpsc::Sender<Value>,
    worker: JoinHandle<()>,
}

impl Forwarder {
    pub fn new(client: reqwest::Client, endpoint: &str, stream_fields: &str) -> Self {
        Self::with_settings(
            client,
            endpoint,
            stream_fields,
            100,
            Duration::from_secs(5),
        )
    }

    /// Test hook: same forwarder, custom batch size and flush interval.
    pub fn with_settings(
        client: reqwest::Client,
        endpoint: &str,
        stream_fields: &str,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        let url = compose_url(endpoint, stream_fields);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let worker = tokio::spawn(run_worker(client, url.clone(), rx, batch_size, flush_interval));
        info!("forwarder started, sending to: {url}");
        Self { url, tx, worker }
    }

    /// The composed insert URL, including stream fields. The dispatcher
    /// compares this against the expected URL to detect reconfiguration.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Enqueue one event onto the private channel. Blocks when the channel
    /// is full, which in turn backpressures the dispatcher.
    pub async fn send(&self, event: Value) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow!("forwarder worker gone for {}", self.url))
    }

    /// Close the channel and wait for the worker to drain remaining events,
    /// perform a final flush, and exit.
    pub async fn stop(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            error!("forwarder worker for {} panicked: {e}", self.url);
        }
    }
}

/// `stream_fields` may arrive already prefixed with `_stream_fields=`
/// (pasted from backend docs); strip it before composing.
pub(crate) fn compose_url(endpoint: &str, stream_fields: &str) -> String {
    let fields = stream_fields
        .trim()
        .strip_prefix("_stream_fields=")
        .unwrap_or(stream_fields.trim());
    let sep = if endpoint.contains('?') { '&' } else { '?' };
    format!("{endpoint}{sep}_stream_fields={fields}")
}

async fn run_worker(
    client: reqwest::Client,
    url: String,
    mut rx: mpsc::Receiver<Value>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut buffer: Vec<Value> = Vec::with_capacity(batch_size);
    let mut events_sent = 0u64;
    let mut errors = 0u64;

    let mut ticker = interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(event) => {
                    buffer.push(event);
                    if buffer.len() >= batch_size {
                        flush(&client, &url, &mut buffer, &mut events_sent, &mut errors).await;
                    }
                }
                // Channel closed and drained: final flush below.
                None => break,
            },
            _ = ticker.tick() => {
                flush(&client, &url, &mut buffer, &mut events_sent, &mut errors).await;
            }
        }
    }

    flush(&client, &url, &mut buffer, &mut events_sent, &mut errors).await;
    info!("forwarder stopped for {url}. Total events: {events_sent}, errors: {errors}");
}

/// Swap the buffer out, encode newline-delimited JSON (one record per
/// line, no array wrapper), POST with `application/x-ndjson`.
async fn flush(
    client: &reqwest::Client,
    url: &str,
    buffer: &mut Vec<Value>,
    events_sent: &mut u64,
    errors: &mut u64,
) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    let count = batch.len() as u64;

    let mut body = String::new();
    for event in &batch {
        body.push_str(&event.to_string());
        body.push('\n');
    }

    match client
        .post(url)
        .timeout(FLUSH_TIMEOUT)
        .header(CONTENT_TYPE, "application/x-ndjson")
        .body(body)
        .send()
        .await
    {
        Ok(resp) if resp.status().as_u16() == 200 || resp.status().as_u16() == 204 => {
            *events_sent += count;
            debug!("flushed {count} events to {url} (total: {events_sent})");
        }
        Ok(resp) => {
            *errors += count;
            error!("unexpected status {} flushing to {url}", resp.status());
        }
        Err(e) => {
            *errors += count;
            error!("failed to flush {count} events to {url}: {e}");
        }
    }
}
