// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Statistics and diagnostic context shared by the SIP services.
//!
//! Services keep lock-free [`Counter`]s and [`Gauge`]s, expose a serializable
//! snapshot and answer administrative commands through [`RemoteService`].
//! Snapshots are published to a process-wide [`StatsSink`].
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use sip_observe::{publish_stats, set_stats_sink, Counter, TracingStatsSink};
//!
//! set_stats_sink(Arc::new(TracingStatsSink));
//! let requests = Counter::default();
//! requests.inc();
//! publish_stats("proxy", &serde_json::json!({ "requests": requests.get() }));
//! ```

use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    Arc,
};

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::Level;

/// Monotonic event counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Level that moves both ways, such as live transactions.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Administrative command surface every service exposes.
pub trait RemoteService: Send + Sync {
    /// Executes a command such as `get numBindings`.
    ///
    /// Returns `None` when the command names an unknown statistic.
    fn exec_cmd(&self, cmd: &str, params: &[&str]) -> Option<String>;

    fn is_alive(&self) -> bool {
        true
    }
}

/// Receives statistics snapshots published by services.
pub trait StatsSink: Send + Sync + 'static {
    fn on_snapshot(&self, service: &str, snapshot: &serde_json::Value);
}

#[derive(Debug, Default)]
struct NoopStatsSink;

impl StatsSink for NoopStatsSink {
    fn on_snapshot(&self, _service: &str, _snapshot: &serde_json::Value) {}
}

/// Sink that logs every snapshot as a JSON string.
#[derive(Debug, Default)]
pub struct TracingStatsSink;

impl StatsSink for TracingStatsSink {
    fn on_snapshot(&self, service: &str, snapshot: &serde_json::Value) {
        tracing::info!(service, stats = %snapshot, "statistics");
    }
}

static STATS_SINK: OnceCell<Arc<dyn StatsSink>> = OnceCell::new();
static NOOP_STATS_SINK: NoopStatsSink = NoopStatsSink;

/// Installs the global statistics sink.
///
/// Returns `true` if the sink was installed, or `false` if one was already set.
pub fn set_stats_sink(sink: Arc<dyn StatsSink>) -> bool {
    STATS_SINK.set(sink).is_ok()
}

pub fn stats_sink() -> &'static dyn StatsSink {
    STATS_SINK
        .get()
        .map(|arc| arc.as_ref())
        .unwrap_or(&NOOP_STATS_SINK)
}

/// Serializes `snapshot` and hands it to the installed sink.
pub fn publish_stats<T: Serialize>(service: &str, snapshot: &T) {
    match serde_json::to_value(snapshot) {
        Ok(value) => stats_sink().on_snapshot(service, &value),
        Err(e) => tracing::warn!(service, error = %e, "failed to serialize statistics"),
    }
}

/// Diagnostic span entered while a request is processed.
pub fn request_span(call_id: &str) -> tracing::Span {
    tracing::span!(Level::INFO, "sip.request", call_id = call_id)
}

/// Diagnostic span entered while a response is processed.
pub fn response_span(call_id: &str) -> tracing::Span {
    tracing::span!(Level::INFO, "sip.response", call_id = call_id)
}
