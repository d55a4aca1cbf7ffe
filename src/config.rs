//! Host configuration
//!
//! The host hands every module a [`HostContext`] once at initialization and a
//! [`RuntimeConfig`] whenever it wants to change capacities. A capacity of
//! `0` means "derive a default from the host memory budget". Resolved
//! capacities are hard caps: pools never grow past them.

use crate::error::{Error, Result};
use crate::slot::MAX_SLOTS;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default host memory budget when the host does not specify one (4 MiB)
pub const DEFAULT_MEMORY_BUDGET: usize = 4 * 1024 * 1024;
/// Microtasks drained per tick when `microtask_budget` is 0
pub const DEFAULT_MICROTASK_BUDGET: usize = 1024;
/// Deferred jobs dispatched per tick when `dispatch_budget` is 0
pub const DEFAULT_DISPATCH_BUDGET: usize = 256;

// Approximate per-record footprint used to derive capacities from the
// memory budget. These only need to be in the right ballpark.
const PROMISE_RECORD_COST: usize = 96;
const REACTION_RECORD_COST: usize = 128;
const STREAM_RECORD_COST: usize = 256;
const ENTRY_COST: usize = 64;
const WAITER_COST: usize = 48;
const JOB_RECORD_COST: usize = 96;

const MIN_POOL: usize = 16;
const MIN_QUEUE: usize = 4;
const MAX_QUEUE: usize = 4096;

bitflags! {
    /// Optional host features
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HostFeatures: u32 {
        /// The host exposes a GPU; modules only record the hint
        const GPU = 1 << 0;
        /// The host collects telemetry snapshots
        const TELEMETRY = 1 << 1;
        /// The host runs several threads and serializes calls into the core
        const THREADED_HOST = 1 << 2;
    }
}

/// One-time host information passed to `initialize`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostContext {
    /// Memory the host is willing to spend on the scheduling core
    pub memory_budget_bytes: usize,
    pub features: HostFeatures,
}

impl Default for HostContext {
    fn default() -> Self {
        Self {
            memory_budget_bytes: DEFAULT_MEMORY_BUDGET,
            features: HostFeatures::TELEMETRY,
        }
    }
}

impl HostContext {
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    pub fn with_features(mut self, features: HostFeatures) -> Self {
        self.features = features;
        self
    }
}

/// Capacity and budget options recognized by the core
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum live promises
    pub promise_capacity: usize,
    /// Maximum live reaction records
    pub reaction_capacity: usize,
    /// Maximum live streams
    pub stream_capacity: usize,
    /// Default per-stream value queue capacity
    pub queue_capacity: usize,
    /// Default per-stream waiter capacity
    pub waiter_capacity: usize,
    /// Maximum pending deferred jobs
    pub deferred_capacity: usize,
    /// Microtasks drained per tick
    pub microtask_budget: usize,
    /// Deferred jobs dispatched per tick
    pub dispatch_budget: usize,
}

/// Fully resolved capacities; every field is non-zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacities {
    pub promise_capacity: usize,
    pub reaction_capacity: usize,
    pub stream_capacity: usize,
    pub queue_capacity: usize,
    pub waiter_capacity: usize,
    pub deferred_capacity: usize,
    pub microtask_budget: usize,
    pub dispatch_budget: usize,
}

impl Default for Capacities {
    /// Fixed fallback used only when a registry is built without a host
    fn default() -> Self {
        Self {
            promise_capacity: 1024,
            reaction_capacity: 1024,
            stream_capacity: 64,
            queue_capacity: 64,
            waiter_capacity: 16,
            deferred_capacity: 256,
            microtask_budget: DEFAULT_MICROTASK_BUDGET,
            dispatch_budget: DEFAULT_DISPATCH_BUDGET,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from JSON. Missing keys default to 0.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::internal(e.to_string()))
    }

    /// Fill zero capacities from the host memory budget and validate the
    /// explicit ones.
    pub fn resolve(&self, context: &HostContext) -> Result<Capacities> {
        let budget = context.memory_budget_bytes;
        let needs_budget = [
            self.promise_capacity,
            self.reaction_capacity,
            self.stream_capacity,
            self.queue_capacity,
            self.waiter_capacity,
            self.deferred_capacity,
        ]
        .contains(&0);
        if needs_budget && budget == 0 {
            return Err(Error::Config(
                "a zero capacity needs a non-zero host memory budget to derive from".into(),
            ));
        }

        // Shares of the budget: promises 30%, reactions 30%, streams 30%,
        // deferred jobs 10%.
        let promise_capacity = pick(
            "promise_capacity",
            self.promise_capacity,
            derive_pool(budget / 10 * 3, PROMISE_RECORD_COST),
        )?;
        let reaction_capacity = pick(
            "reaction_capacity",
            self.reaction_capacity,
            derive_pool(budget / 10 * 3, REACTION_RECORD_COST),
        )?;
        let queue_capacity = pick_queue("queue_capacity", self.queue_capacity, 64)?;
        let waiter_capacity = pick_queue("waiter_capacity", self.waiter_capacity, 16)?;
        let per_stream = STREAM_RECORD_COST + queue_capacity * ENTRY_COST + waiter_capacity * WAITER_COST;
        let stream_capacity = pick(
            "stream_capacity",
            self.stream_capacity,
            derive_pool(budget / 10 * 3, per_stream),
        )?;
        let deferred_capacity = pick(
            "deferred_capacity",
            self.deferred_capacity,
            derive_pool(budget / 10, JOB_RECORD_COST),
        )?;

        Ok(Capacities {
            promise_capacity,
            reaction_capacity,
            stream_capacity,
            queue_capacity,
            waiter_capacity,
            deferred_capacity,
            microtask_budget: nonzero_or(self.microtask_budget, DEFAULT_MICROTASK_BUDGET),
            dispatch_budget: nonzero_or(self.dispatch_budget, DEFAULT_DISPATCH_BUDGET),
        })
    }
}

fn derive_pool(bytes: usize, cost: usize) -> usize {
    (bytes / cost.max(1)).clamp(MIN_POOL, MAX_SLOTS)
}

fn pick(name: &str, explicit: usize, derived: usize) -> Result<usize> {
    match explicit {
        0 => Ok(derived),
        n if n > MAX_SLOTS => Err(Error::Config(format!(
            "{} of {} exceeds the handle index space ({})",
            name, n, MAX_SLOTS
        ))),
        n => Ok(n),
    }
}

fn pick_queue(name: &str, explicit: usize, default: usize) -> Result<usize> {
    match explicit {
        0 => Ok(default.clamp(MIN_QUEUE, MAX_QUEUE)),
        n if n > MAX_QUEUE => Err(Error::Config(format!(
            "{} of {} exceeds the per-stream limit ({})",
            name, n, MAX_QUEUE
        ))),
        n => Ok(n),
    }
}

fn nonzero_or(value: usize, default: usize) -> usize {
    if value == 0 {
        default
    } else {
        value
    }
}
