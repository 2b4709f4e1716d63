//! Ingest pipeline: queue, dispatcher, and per-tenant batching forwarders.
//!
//! Event flow:
//! HTTP handler → bounded [`LogPayload`] queue → [`Dispatcher`] →
//! per-ingest-config [`Forwarder`] → log backend (NDJSON insert).
//!
//! The queue is the backpressure point: handlers block on a full queue
//! instead of dropping, so a 202 response means the payload is owned by
//! the pipeline until it is flushed or the process stops.

mod dispatcher;
mod forwarder;

pub use dispatcher::{Dispatcher, DispatcherSettings, LogPayload};
pub use forwarder::Forwarder;
