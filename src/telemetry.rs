//! Telemetry snapshots
//!
//! A [`TelemetrySnapshot`] is a point-in-time copy of every module's
//! counters plus the live pool sizes. It is plain data: hosts serialize it
//! with [`TelemetrySnapshot::to_json`] and ship it wherever they like.

use crate::config::Capacities;
use crate::deferred::{DeferredDispatcher, DeferredStats};
use crate::error::{Error, Result};
use crate::promise::{PromiseRegistry, PromiseStats};
use crate::stream::{StreamEngine, StreamStats};
use serde::Serialize;

/// Promise registry gauges and counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromiseTelemetry {
    pub live_promises: usize,
    pub live_reactions: usize,
    pub pending_microtasks: usize,
    pub stats: PromiseStats,
}

impl PromiseTelemetry {
    pub fn collect(registry: &PromiseRegistry) -> Self {
        Self {
            live_promises: registry.live_promises(),
            live_reactions: registry.live_reactions(),
            pending_microtasks: registry.pending_microtasks(),
            stats: registry.stats(),
        }
    }
}

/// Stream engine gauges and counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamTelemetry {
    pub live_streams: usize,
    /// Results delivered to waiters but not yet drained by the host
    pub pending_results: usize,
    pub stats: StreamStats,
}

impl StreamTelemetry {
    pub fn collect(engine: &StreamEngine) -> Self {
        Self {
            live_streams: engine.live_streams(),
            pending_results: engine.pending_results(),
            stats: engine.stats(),
        }
    }
}

/// Deferred dispatcher gauges and counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeferredTelemetry {
    pub pending_jobs: usize,
    pub stats: DeferredStats,
}

impl DeferredTelemetry {
    pub fn collect(dispatcher: &DeferredDispatcher) -> Self {
        Self {
            pending_jobs: dispatcher.pending_jobs(),
            stats: dispatcher.stats(),
        }
    }
}

/// Everything the runtime reports in one frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub version: &'static str,
    pub frame: u64,
    pub elapsed_seconds: f64,
    /// The recorded `optimize_gpu` hint. No work is offloaded.
    pub gpu_hint: bool,
    pub capacities: Capacities,
    pub promises: PromiseTelemetry,
    pub streams: StreamTelemetry,
    pub deferred: DeferredTelemetry,
}

impl TelemetrySnapshot {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::internal(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::internal(e.to_string()))
    }

    /// Total callback failures and panics across promises and deferred jobs
    pub fn contained_failures(&self) -> u64 {
        self.promises.stats.callback_failures
            + self.promises.stats.callback_panics
            + self.deferred.stats.failed
            + self.deferred.stats.panicked
    }

    /// Total refused allocations across every pool and queue
    pub fn overflow_events(&self) -> u64 {
        self.promises.stats.promise_overflow
            + self.promises.stats.reaction_overflow
            + self.streams.stats.stream_overflow
            + self.streams.stats.queue_overflow
            + self.streams.stats.waiter_overflow
            + self.deferred.stats.overflow
    }
}
