//! Promise registry
//!
//! Promises are records in a generational slot pool, addressed by
//! [`PromiseHandle`]. Each promise keeps an intrusive FIFO of reactions
//! (stored in a second pool) that is walked exactly once, when the promise
//! settles, and handed to the microtask queue.
//!
//! ## State machine
//!
//! ```text
//!            resolve
//!          +---------> Fulfilled
//!          |  reject
//! Pending -+---------> Rejected
//!          |  cancel
//!          +---------> Cancelled
//! ```
//!
//! Terminal states never change again. Callbacks never run inside the call
//! that makes them runnable: `then`, `resolve`, `reject` and `cancel` only
//! queue work, and [`PromiseRegistry::process_microtasks`] (or `tick`)
//! executes it.
//!
//! # Example
//! ```
//! use mercury::promise::{PromiseRegistry, PromiseState, ReactionOptions};
//! use mercury::Value;
//!
//! let mut registry = PromiseRegistry::new();
//! let source = registry.create_promise("source").unwrap();
//! let derived = registry
//!     .then(source, ReactionOptions::new().on_fulfilled(|input| Ok(input.value().clone())))
//!     .unwrap();
//!
//! registry.resolve(source, Value::from(42), "").unwrap();
//! assert_eq!(registry.state(derived).unwrap(), PromiseState::Pending);
//!
//! registry.process_microtasks(16);
//! assert_eq!(registry.state(derived).unwrap(), PromiseState::Fulfilled);
//! ```

mod microtask;
mod reaction;

pub use microtask::DrainReport;
pub use reaction::{
    CallbackResult, ReactionFn, ReactionInput, ReactionOptions, Rejection, Settlement,
};

use crate::config::{Capacities, HostContext, RuntimeConfig};
use crate::error::{messages, Error, ResourceKind, Result};
use crate::lifecycle::{FrameClock, FrameInfo, RuntimeModule, TickReport};
use crate::slot::{typed_handle, Handle, SlotAllocator};
use crate::value::Value;
use microtask::MicrotaskQueue;
use reaction::ReactionRecord;
use rustc_hash::FxHashMap as HashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

typed_handle!(
    /// Handle to a promise in a [`PromiseRegistry`]
    PromiseHandle
);

/// Promise state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PromiseState {
    /// Not yet settled
    Pending,
    /// Settled with a value
    Fulfilled,
    /// Settled with diagnostics
    Rejected,
    /// Abandoned before settling; reactions see a rejection
    Cancelled,
}

impl PromiseState {
    pub fn is_terminal(self) -> bool {
        self != PromiseState::Pending
    }
}

impl fmt::Display for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromiseState::Pending => write!(f, "pending"),
            PromiseState::Fulfilled => write!(f, "fulfilled"),
            PromiseState::Rejected => write!(f, "rejected"),
            PromiseState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug)]
struct PromiseRecord {
    state: PromiseState,
    value: Value,
    diagnostics: String,
    reaction_head: Option<Handle>,
    reaction_tail: Option<Handle>,
    settled_frame: Option<u64>,
    settled_seconds: Option<f64>,
    label: String,
}

impl PromiseRecord {
    fn new(label: String) -> Self {
        Self {
            state: PromiseState::Pending,
            value: Value::Undefined,
            diagnostics: String::new(),
            reaction_head: None,
            reaction_tail: None,
            settled_frame: None,
            settled_seconds: None,
            label,
        }
    }
}

/// Read-only copy of a promise record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromiseSnapshot {
    pub state: PromiseState,
    pub value: Value,
    pub diagnostics: String,
    pub settled_frame: Option<u64>,
    pub settled_seconds: Option<f64>,
    pub label: String,
    /// Reactions still attached (only non-zero while pending)
    pub attached_reactions: usize,
}

/// A rejection nobody had reacted to when it happened
#[derive(Debug, Clone, PartialEq)]
pub struct UnhandledRejection {
    pub promise: PromiseHandle,
    pub diagnostics: String,
    pub value: Value,
    pub frame: u64,
    sequence: u64,
}

/// Counters exported with telemetry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseStats {
    pub promises_created: u64,
    pub promises_settled: u64,
    pub promises_fulfilled: u64,
    pub promises_rejected: u64,
    pub promises_cancelled: u64,
    pub promises_released: u64,
    /// `create_promise`/`then` refused because the promise pool was full
    pub promise_overflow: u64,
    /// `then` refused because the reaction pool was full
    pub reaction_overflow: u64,
    pub reactions_attached: u64,
    pub reactions_run: u64,
    pub orphaned_reactions: u64,
    /// Callbacks that returned `Err`
    pub callback_failures: u64,
    pub callback_panics: u64,
    pub unhandled_rejections: u64,
    pub microtasks_processed: u64,
    pub max_microtasks_per_drain: u64,
    pub ticks: u64,
}

/// Promise pool, reaction pool and microtask queue of one runtime
pub struct PromiseRegistry {
    promises: SlotAllocator<PromiseRecord>,
    reactions: SlotAllocator<ReactionRecord>,
    microtasks: MicrotaskQueue,
    unhandled: HashMap<PromiseHandle, UnhandledRejection>,
    unhandled_sequence: u64,
    clock: FrameClock,
    context: HostContext,
    capacities: Capacities,
    initialized: bool,
    gpu_hint: bool,
    stats: PromiseStats,
}

impl Default for PromiseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PromiseRegistry {
    /// Create a registry sized from the default host context
    pub fn new() -> Self {
        let context = HostContext::default();
        let capacities = RuntimeConfig::default()
            .resolve(&context)
            .unwrap_or_default();
        Self::with_capacities(context, capacities)
    }

    pub fn with_capacities(context: HostContext, capacities: Capacities) -> Self {
        Self {
            promises: SlotAllocator::new(ResourceKind::Promise, capacities.promise_capacity),
            reactions: SlotAllocator::new(ResourceKind::Reaction, capacities.reaction_capacity),
            microtasks: MicrotaskQueue::default(),
            unhandled: HashMap::default(),
            unhandled_sequence: 0,
            clock: FrameClock::default(),
            context,
            capacities,
            initialized: false,
            gpu_hint: false,
            stats: PromiseStats::default(),
        }
    }

    /// Build and initialize a registry from host configuration
    pub fn from_config(context: &HostContext, config: &RuntimeConfig) -> Result<Self> {
        let mut registry = Self::with_capacities(context.clone(), config.resolve(context)?);
        registry.initialized = true;
        Ok(registry)
    }

    /// Allocate a pending promise
    pub fn create_promise(&mut self, label: impl Into<String>) -> Result<PromiseHandle> {
        match self.promises.acquire(PromiseRecord::new(label.into())) {
            Ok(handle) => {
                self.stats.promises_created += 1;
                Ok(PromiseHandle(handle))
            }
            Err(err) => {
                self.stats.promise_overflow += 1;
                warn!("promise pool exhausted: {}", err);
                Err(err)
            }
        }
    }

    /// Fulfill a pending promise and queue its reactions
    pub fn resolve(
        &mut self,
        promise: PromiseHandle,
        value: Value,
        diagnostics: impl Into<String>,
    ) -> Result<()> {
        self.settle(promise, PromiseState::Fulfilled, value, diagnostics.into())
    }

    /// Shorthand for [`resolve`](Self::resolve) without diagnostics
    pub fn fulfill(&mut self, promise: PromiseHandle, value: Value) -> Result<()> {
        self.resolve(promise, value, "")
    }

    /// Reject a pending promise. `diagnostics` must not be empty.
    pub fn reject(
        &mut self,
        promise: PromiseHandle,
        diagnostics: impl Into<String>,
        value: Value,
    ) -> Result<()> {
        let diagnostics = diagnostics.into();
        if diagnostics.is_empty() {
            return Err(Error::invalid_argument(messages::EMPTY_DIAGNOSTICS));
        }
        self.settle(promise, PromiseState::Rejected, value, diagnostics)
    }

    /// Cancel a pending promise. Returns `Ok(false)` when it had already
    /// settled. Attached reactions take their `on_rejected` path with the
    /// diagnostic `"cancelled"`.
    pub fn cancel(&mut self, promise: PromiseHandle) -> Result<bool> {
        if self.promises.get(promise.0)?.state.is_terminal() {
            return Ok(false);
        }
        self.settle(
            promise,
            PromiseState::Cancelled,
            Value::Undefined,
            messages::CANCELLED.to_string(),
        )?;
        Ok(true)
    }

    /// Free a promise in any state. Reactions still attached to it are
    /// dropped; queued reactions that reference it are skipped at drain time.
    pub fn release(&mut self, promise: PromiseHandle) -> Result<()> {
        let record = self.promises.release(promise.0)?;
        self.stats.promises_released += 1;
        self.unhandled.remove(&promise);

        let mut dropped = 0u64;
        let mut cursor = record.reaction_head;
        while let Some(reaction) = cursor {
            let orphan = self.reactions.release(reaction).map_err(|_| {
                Error::internal(format!("reaction list of {} is corrupt", promise))
            })?;
            cursor = orphan.next;
            dropped += 1;
        }
        if dropped > 0 {
            self.stats.orphaned_reactions += dropped;
            debug!("released {} with {} attached reactions", promise, dropped);
        }
        Ok(())
    }

    /// Attach a reaction to `source` and return the derived promise.
    ///
    /// If `source` is already settled the reaction is queued right away;
    /// otherwise it waits in the source's reaction list.
    pub fn then(&mut self, source: PromiseHandle, options: ReactionOptions) -> Result<PromiseHandle> {
        let source_state = self.promises.get(source.0)?.state;
        if self.reactions.is_full() {
            self.stats.reaction_overflow += 1;
            let err = Error::capacity_exceeded(ResourceKind::Reaction, self.reactions.max_slots());
            warn!("reaction pool exhausted: {}", err);
            return Err(err);
        }

        let derived = self.create_promise(options.label.clone())?;
        let reaction = match self
            .reactions
            .acquire(ReactionRecord::new(source, derived, options))
        {
            Ok(reaction) => reaction,
            Err(err) => {
                self.promises.release(derived.0)?;
                return Err(err);
            }
        };
        self.stats.reactions_attached += 1;

        if source_state.is_terminal() {
            let settlement = self.settlement_of(source)?;
            self.unhandled.remove(&source);
            self.queue_reaction(reaction, settlement)?;
        } else {
            let tail = self.promises.get(source.0)?.reaction_tail;
            match tail {
                Some(tail) => {
                    self.reactions
                        .get_mut(tail)
                        .map_err(|_| Error::internal(format!("reaction tail of {} is stale", source)))?
                        .next = Some(reaction);
                }
                None => self.promises.get_mut(source.0)?.reaction_head = Some(reaction),
            }
            self.promises.get_mut(source.0)?.reaction_tail = Some(reaction);
        }

        Ok(derived)
    }

    /// `then` with only a rejection handler
    pub fn catch<F>(
        &mut self,
        source: PromiseHandle,
        label: impl Into<String>,
        on_rejected: F,
    ) -> Result<PromiseHandle>
    where
        F: FnOnce(&ReactionInput<'_>) -> CallbackResult + 'static,
    {
        self.then(source, ReactionOptions::new().on_rejected(on_rejected).label(label))
    }

    pub fn state(&self, promise: PromiseHandle) -> Result<PromiseState> {
        Ok(self.promises.get(promise.0)?.state)
    }

    pub fn is_pending(&self, promise: PromiseHandle) -> bool {
        self.promises
            .resolve(promise.0)
            .is_some_and(|record| record.state == PromiseState::Pending)
    }

    pub fn contains(&self, promise: PromiseHandle) -> bool {
        self.promises.contains(promise.0)
    }

    pub fn snapshot(&self, promise: PromiseHandle) -> Result<PromiseSnapshot> {
        let record = self.promises.get(promise.0)?;
        let mut attached_reactions = 0;
        let mut cursor = record.reaction_head;
        while let Some(reaction) = cursor {
            attached_reactions += 1;
            cursor = self.reactions.resolve(reaction).and_then(|r| r.next);
        }
        Ok(PromiseSnapshot {
            state: record.state,
            value: record.value.clone(),
            diagnostics: record.diagnostics.clone(),
            settled_frame: record.settled_frame,
            settled_seconds: record.settled_seconds,
            label: record.label.clone(),
            attached_reactions,
        })
    }

    /// Take every rejection that had no reaction attached when it happened
    /// (and has not gained one since), in settlement order.
    pub fn drain_unhandled_rejections(&mut self) -> Vec<UnhandledRejection> {
        let mut drained: Vec<_> = self.unhandled.drain().map(|(_, r)| r).collect();
        drained.sort_by_key(|r| r.sequence);
        drained
    }

    pub fn live_promises(&self) -> usize {
        self.promises.len()
    }

    pub fn live_reactions(&self) -> usize {
        self.reactions.len()
    }

    pub fn capacities(&self) -> &Capacities {
        &self.capacities
    }

    pub fn clock(&self) -> FrameClock {
        self.clock
    }

    pub fn gpu_hint(&self) -> bool {
        self.gpu_hint
    }

    pub fn stats(&self) -> PromiseStats {
        self.stats.clone()
    }

    pub fn reset_stats(&mut self) {
        self.stats = PromiseStats::default();
    }

    fn settle(
        &mut self,
        promise: PromiseHandle,
        state: PromiseState,
        value: Value,
        diagnostics: String,
    ) -> Result<()> {
        let frame = self.clock.frame();
        let seconds = self.clock.elapsed_seconds();
        let record = self.promises.get_mut(promise.0)?;
        if record.state.is_terminal() {
            return Err(Error::invalid_argument(format!(
                "{}: {} is {}",
                messages::ALREADY_SETTLED,
                promise,
                record.state
            )));
        }

        record.state = state;
        record.value = value;
        record.diagnostics = diagnostics;
        record.settled_frame = Some(frame);
        record.settled_seconds = Some(seconds);
        let head = record.reaction_head.take();
        record.reaction_tail = None;
        let settlement = Settlement {
            state,
            value: record.value.clone(),
            diagnostics: record.diagnostics.clone(),
        };

        self.stats.promises_settled += 1;
        match state {
            PromiseState::Fulfilled => self.stats.promises_fulfilled += 1,
            PromiseState::Rejected => self.stats.promises_rejected += 1,
            PromiseState::Cancelled => self.stats.promises_cancelled += 1,
            PromiseState::Pending => {}
        }
        debug!("{} settled {} in frame {}", promise, state, frame);

        if state == PromiseState::Rejected && head.is_none() {
            self.track_unhandled(promise, &settlement, frame);
        }

        let mut cursor = head;
        while let Some(reaction) = cursor {
            cursor = self
                .reactions
                .get_mut(reaction)
                .map_err(|_| Error::internal(format!("reaction list of {} is corrupt", promise)))?
                .next
                .take();
            self.queue_reaction(reaction, settlement.clone())?;
        }
        Ok(())
    }

    fn queue_reaction(&mut self, reaction: Handle, settlement: Settlement) -> Result<()> {
        let record = self
            .reactions
            .get_mut(reaction)
            .map_err(|_| Error::internal(format!("cannot queue stale reaction {}", reaction)))?;
        record.snapshot = Some(settlement);
        self.microtasks.push(reaction);
        Ok(())
    }

    fn settlement_of(&self, promise: PromiseHandle) -> Result<Settlement> {
        let record = self.promises.get(promise.0)?;
        Ok(Settlement {
            state: record.state,
            value: record.value.clone(),
            diagnostics: record.diagnostics.clone(),
        })
    }

    fn track_unhandled(&mut self, promise: PromiseHandle, settlement: &Settlement, frame: u64) {
        self.stats.unhandled_rejections += 1;
        self.unhandled_sequence += 1;
        warn!("unhandled rejection of {}: {}", promise, settlement.diagnostics);
        self.unhandled.insert(
            promise,
            UnhandledRejection {
                promise,
                diagnostics: settlement.diagnostics.clone(),
                value: settlement.value.clone(),
                frame,
                sequence: self.unhandled_sequence,
            },
        );
    }
}

impl RuntimeModule for PromiseRegistry {
    fn name(&self) -> &'static str {
        "promise"
    }

    fn initialize(&mut self, context: &HostContext, config: &RuntimeConfig) -> Result<()> {
        if self.initialized {
            return Err(Error::invalid_argument("promise registry is already initialized"));
        }
        let capacities = config.resolve(context)?;
        self.context = context.clone();
        self.apply(capacities);
        self.initialized = true;
        debug!(
            "promise registry initialized: {} promises, {} reactions",
            capacities.promise_capacity, capacities.reaction_capacity
        );
        Ok(())
    }

    fn tick(&mut self, frame: FrameInfo) -> Result<TickReport> {
        self.clock.advance(frame)?;
        self.stats.ticks += 1;
        let report = self.process_microtasks(self.capacities.microtask_budget);
        Ok(TickReport {
            processed: report.processed,
            remaining: report.remaining,
        })
    }

    fn optimize_gpu(&mut self, enable: bool) {
        self.gpu_hint = enable;
    }

    fn reconfigure(&mut self, config: &RuntimeConfig) -> Result<()> {
        let capacities = config.resolve(&self.context)?;
        self.apply(capacities);
        Ok(())
    }
}

impl PromiseRegistry {
    fn apply(&mut self, capacities: Capacities) {
        self.promises.set_max_slots(capacities.promise_capacity);
        self.reactions.set_max_slots(capacities.reaction_capacity);
        self.capacities = capacities;
    }
}

impl fmt::Debug for PromiseRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseRegistry")
            .field("live_promises", &self.promises.len())
            .field("live_reactions", &self.reactions.len())
            .field("pending_microtasks", &self.microtasks.len())
            .field("clock", &self.clock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn registry() -> PromiseRegistry {
        PromiseRegistry::new()
    }

    fn small_registry(promises: usize, reactions: usize) -> PromiseRegistry {
        let config = RuntimeConfig {
            promise_capacity: promises,
            reaction_capacity: reactions,
            ..RuntimeConfig::default()
        };
        PromiseRegistry::from_config(&HostContext::default(), &config).unwrap()
    }

    fn identity() -> ReactionOptions {
        ReactionOptions::new().on_fulfilled(|input| Ok(input.value().clone()))
    }

    #[test]
    fn test_create_is_pending() {
        let mut reg = registry();
        let p = reg.create_promise("p").unwrap();
        assert_eq!(reg.state(p).unwrap(), PromiseState::Pending);
        assert!(reg.is_pending(p));
        assert_eq!(reg.snapshot(p).unwrap().label, "p");
    }

    #[test]
    fn test_double_resolve() {
        let mut reg = registry();
        let p = reg.create_promise("p").unwrap();
        assert!(reg.resolve(p, Value::from(1), "").is_ok());
        let err = reg.resolve(p, Value::from(2), "").unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);

        let snap = reg.snapshot(p).unwrap();
        assert_eq!(snap.state, PromiseState::Fulfilled);
        assert_eq!(snap.value, Value::from(1));
    }

    #[test]
    fn test_reject_requires_diagnostics() {
        let mut reg = registry();
        let p = reg.create_promise("p").unwrap();
        let err = reg.reject(p, "", Value::Undefined).unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
        assert!(reg.is_pending(p));

        reg.reject(p, "boom", Value::from(3)).unwrap();
        let snap = reg.snapshot(p).unwrap();
        assert_eq!(snap.state, PromiseState::Rejected);
        assert_eq!(snap.diagnostics, "boom");
    }

    #[test]
    fn test_then_never_runs_inline() {
        let mut reg = registry();
        let ran = Rc::new(RefCell::new(false));
        let p = reg.create_promise("p").unwrap();
        reg.fulfill(p, Value::from(1)).unwrap();

        let flag = ran.clone();
        let d = reg
            .then(
                p,
                ReactionOptions::new().on_fulfilled(move |_| {
                    *flag.borrow_mut() = true;
                    Ok(Value::Undefined)
                }),
            )
            .unwrap();

        assert!(!*ran.borrow());
        assert!(reg.is_pending(d));
        assert_eq!(reg.pending_microtasks(), 1);

        reg.process_microtasks(8);
        assert!(*ran.borrow());
        assert_eq!(reg.state(d).unwrap(), PromiseState::Fulfilled);
    }

    #[test]
    fn test_cancel_runs_rejection_path() {
        let mut reg = registry();
        let p = reg.create_promise("p").unwrap();
        let seen = Rc::new(RefCell::new(String::new()));
        let sink = seen.clone();
        let d = reg
            .then(
                p,
                ReactionOptions::new().on_rejected(move |input| {
                    *sink.borrow_mut() = input.diagnostics().to_string();
                    Ok(Value::from("recovered"))
                }),
            )
            .unwrap();

        assert!(reg.cancel(p).unwrap());
        assert!(!reg.cancel(p).unwrap());
        reg.process_microtasks(8);

        assert_eq!(*seen.borrow(), "cancelled");
        assert_eq!(reg.state(p).unwrap(), PromiseState::Cancelled);
        assert_eq!(reg.snapshot(d).unwrap().value, Value::from("recovered"));
    }

    #[test]
    fn test_cancel_on_fulfilled_is_noop() {
        let mut reg = registry();
        let p = reg.create_promise("p").unwrap();
        reg.fulfill(p, Value::from(1)).unwrap();
        assert!(!reg.cancel(p).unwrap());
        assert_eq!(reg.state(p).unwrap(), PromiseState::Fulfilled);
    }

    #[test]
    fn test_capacity_overflow_metric() {
        let mut reg = small_registry(2, 8);
        reg.create_promise("a").unwrap();
        reg.create_promise("b").unwrap();
        let err = reg.create_promise("c").unwrap_err();
        assert_eq!(err.status(), Status::CapacityExceeded);
        assert_eq!(reg.stats().promise_overflow, 1);
    }

    #[test]
    fn test_reaction_pool_overflow() {
        let mut reg = small_registry(8, 1);
        let p = reg.create_promise("p").unwrap();
        reg.then(p, identity()).unwrap();
        let err = reg.then(p, identity()).unwrap_err();
        assert_eq!(err.status(), Status::CapacityExceeded);
        assert_eq!(reg.stats().reaction_overflow, 1);
        // The refused `then` must not leak a derived promise.
        assert_eq!(reg.live_promises(), 2);
    }

    #[test]
    fn test_release_then_resolve_is_not_found() {
        let mut reg = registry();
        let p = reg.create_promise("p").unwrap();
        reg.release(p).unwrap();
        let err = reg.resolve(p, Value::from(1), "").unwrap_err();
        assert_eq!(err.status(), Status::NotFound);

        let q = reg.create_promise("q").unwrap();
        assert_eq!(q.handle().index(), p.handle().index());
        reg.resolve(q, Value::from(2), "").unwrap();
        assert_eq!(reg.state(q).unwrap(), PromiseState::Fulfilled);
        assert_eq!(reg.state(p).unwrap_err().status(), Status::NotFound);
    }

    #[test]
    fn test_release_drops_attached_reactions() {
        let mut reg = registry();
        let p = reg.create_promise("p").unwrap();
        reg.then(p, identity()).unwrap();
        reg.then(p, identity()).unwrap();
        assert_eq!(reg.snapshot(p).unwrap().attached_reactions, 2);

        reg.release(p).unwrap();
        assert_eq!(reg.live_reactions(), 0);
        assert_eq!(reg.stats().orphaned_reactions, 2);
    }

    #[test]
    fn test_queued_reaction_skipped_after_release() {
        let mut reg = registry();
        let ran = Rc::new(RefCell::new(false));
        let flag = ran.clone();
        let p = reg.create_promise("p").unwrap();
        reg.then(
            p,
            ReactionOptions::new().on_fulfilled(move |_| {
                *flag.borrow_mut() = true;
                Ok(Value::Undefined)
            }),
        )
        .unwrap();
        reg.fulfill(p, Value::from(1)).unwrap();
        reg.release(p).unwrap();

        let report = reg.process_microtasks(8);
        assert_eq!(report.orphaned, 1);
        assert!(!*ran.borrow());
    }

    #[test]
    fn test_missing_handler_passes_through() {
        let mut reg = registry();
        let p = reg.create_promise("p").unwrap();
        let d = reg
            .then(p, ReactionOptions::new().on_fulfilled(|_| Ok(Value::Null)))
            .unwrap();
        reg.reject(p, "bad input", Value::from(9)).unwrap();
        reg.process_microtasks(8);

        let snap = reg.snapshot(d).unwrap();
        assert_eq!(snap.state, PromiseState::Rejected);
        assert_eq!(snap.diagnostics, "bad input");
        assert_eq!(snap.value, Value::from(9));
    }

    #[test]
    fn test_failing_callback_is_contained() {
        let mut reg = registry();
        let p = reg.create_promise("p").unwrap();
        let failing = reg
            .then(p, ReactionOptions::new().on_fulfilled(|_| Err(Rejection::new("nope"))))
            .unwrap();
        let panicking = reg
            .then(p, ReactionOptions::new().on_fulfilled(|_| panic!("kaboom")))
            .unwrap();
        let healthy = reg.then(p, identity()).unwrap();

        reg.fulfill(p, Value::from(5)).unwrap();
        let report = reg.process_microtasks(8);

        assert_eq!(report.processed, 3);
        assert_eq!(reg.snapshot(failing).unwrap().diagnostics, "nope");
        let panicked = reg.snapshot(panicking).unwrap();
        assert_eq!(panicked.state, PromiseState::Rejected);
        assert!(panicked.diagnostics.contains("kaboom"));
        assert_eq!(reg.snapshot(healthy).unwrap().value, Value::from(5));
        assert_eq!(reg.stats().callback_failures, 1);
        assert_eq!(reg.stats().callback_panics, 1);
    }

    #[test]
    fn test_unhandled_rejection_tracking() {
        let mut reg = registry();
        let handled = reg.create_promise("handled").unwrap();
        reg.catch(handled, "catch", |_| Ok(Value::Undefined)).unwrap();
        reg.reject(handled, "first", Value::Undefined).unwrap();

        let late = reg.create_promise("late").unwrap();
        reg.reject(late, "second", Value::Undefined).unwrap();
        let ignored = reg.create_promise("ignored").unwrap();
        reg.reject(ignored, "third", Value::Undefined).unwrap();
        reg.catch(late, "late catch", |_| Ok(Value::Undefined)).unwrap();

        let unhandled = reg.drain_unhandled_rejections();
        assert_eq!(unhandled.len(), 1);
        assert_eq!(unhandled[0].promise, ignored);
        assert_eq!(unhandled[0].diagnostics, "third");
        assert!(reg.drain_unhandled_rejections().is_empty());
    }

    #[test]
    fn test_tick_records_settlement_time() {
        let mut reg = registry();
        reg.tick(FrameInfo::new(3, 0.5)).unwrap();
        let p = reg.create_promise("p").unwrap();
        reg.fulfill(p, Value::Undefined).unwrap();
        let snap = reg.snapshot(p).unwrap();
        assert_eq!(snap.settled_frame, Some(3));
        assert_eq!(snap.settled_seconds, Some(0.5));
    }

    #[test]
    fn test_initialize_twice_fails() {
        let mut reg = registry();
        reg.initialize(&HostContext::default(), &RuntimeConfig::default())
            .unwrap();
        assert!(reg
            .initialize(&HostContext::default(), &RuntimeConfig::default())
            .is_err());
    }

    #[test]
    fn test_reconfigure_keeps_live_handles() {
        let mut reg = small_registry(4, 4);
        let a = reg.create_promise("a").unwrap();
        let b = reg.create_promise("b").unwrap();
        reg.reconfigure(&RuntimeConfig {
            promise_capacity: 1,
            reaction_capacity: 4,
            ..RuntimeConfig::default()
        })
        .unwrap();

        assert!(reg.is_pending(a));
        assert!(reg.is_pending(b));
        assert_eq!(reg.create_promise("c").unwrap_err().status(), Status::CapacityExceeded);
        reg.fulfill(a, Value::from(1)).unwrap();
        assert_eq!(reg.state(a).unwrap(), PromiseState::Fulfilled);
    }

    #[test]
    fn test_gpu_hint_is_recorded_only() {
        let mut reg = registry();
        reg.optimize_gpu(true);
        assert!(reg.gpu_hint());
        assert_eq!(reg.process_microtasks(8), DrainReport::default());
    }
}
