//! Runtime facade
//!
//! [`Runtime`] owns one instance of every scheduling module and drives them
//! from a single `tick`. Within a frame the order is fixed:
//!
//! 1. due deferred jobs run (bounded by `dispatch_budget`);
//! 2. promise timeouts those jobs produced are applied;
//! 3. queued microtasks drain (bounded by `microtask_budget`);
//! 4. streams observe the new frame.

use crate::config::{Capacities, HostContext, RuntimeConfig};
use crate::deferred::{DeferredDispatcher, DeferredOptions, JobHandle};
use crate::error::{Error, Result};
use crate::lifecycle::{FrameClock, FrameInfo, RuntimeModule, TickReport};
use crate::promise::{PromiseHandle, PromiseRegistry};
use crate::stream::StreamEngine;
use crate::telemetry::{DeferredTelemetry, PromiseTelemetry, StreamTelemetry, TelemetrySnapshot};
use crate::value::Value;
use serde::Serialize;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, info_span, trace, warn};

/// Per-module work done in one [`Runtime::tick`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FrameReport {
    pub frame: u64,
    pub deferred: TickReport,
    /// Promise timeouts applied this frame
    pub timeouts: usize,
    pub microtasks: TickReport,
    pub streams: TickReport,
}

impl FrameReport {
    /// Whether any module still has bounded work left over
    pub fn has_backlog(&self) -> bool {
        self.deferred.remaining > 0 || self.microtasks.remaining > 0
    }
}

#[derive(Debug)]
enum Timeout {
    Resolve(Value),
    Reject(String),
}

type TimeoutOutbox = Rc<RefCell<Vec<(PromiseHandle, Timeout)>>>;

/// The scheduling core as one unit
pub struct Runtime {
    context: HostContext,
    config: RuntimeConfig,
    clock: FrameClock,
    gpu_hint: bool,
    promises: PromiseRegistry,
    streams: StreamEngine,
    deferred: DeferredDispatcher,
    timeouts: TimeoutOutbox,
}

impl Runtime {
    /// Build and initialize every module from one configuration
    pub fn new(config: RuntimeConfig, context: HostContext) -> Result<Self> {
        let capacities = config.resolve(&context)?;
        let mut runtime = Self {
            promises: PromiseRegistry::with_capacities(context.clone(), capacities),
            streams: StreamEngine::with_capacities(context.clone(), capacities),
            deferred: DeferredDispatcher::with_capacities(context.clone(), capacities),
            context,
            config,
            clock: FrameClock::default(),
            gpu_hint: false,
            timeouts: Rc::new(RefCell::new(Vec::new())),
        };

        let (context, config) = (runtime.context.clone(), runtime.config.clone());
        for module in runtime.modules_mut() {
            module.initialize(&context, &config)?;
        }
        debug!(
            "runtime initialized with {} byte budget: {:?}",
            context.memory_budget_bytes, capacities
        );
        Ok(runtime)
    }

    /// Runtime with the default host context and derived capacities
    pub fn with_defaults() -> Result<Self> {
        Self::new(RuntimeConfig::default(), HostContext::default())
    }

    /// Advance every module to `frame_index`.
    ///
    /// The frame is checked against the runtime clock and every module clock
    /// before anything runs, so a rejected frame leaves every module
    /// untouched. Modules ticked directly through `*_mut` accessors count.
    pub fn tick(&mut self, frame_index: u64, delta_seconds: f64) -> Result<FrameReport> {
        let frame = FrameInfo::new(frame_index, delta_seconds);
        let clocks = [
            self.clock,
            self.deferred.clock(),
            self.promises.clock(),
            self.streams.clock(),
        ];
        for mut clock in clocks {
            clock.advance(frame)?;
        }
        self.clock.advance(frame)?;
        let _span = info_span!("tick", frame = frame_index).entered();

        let deferred = self.deferred.tick(frame)?;
        let timeouts = self.apply_timeouts();
        let microtasks = self.promises.tick(frame)?;
        let streams = self.streams.tick(frame)?;

        let report = FrameReport {
            frame: frame_index,
            deferred,
            timeouts,
            microtasks,
            streams,
        };
        trace!("{:?}", report);
        Ok(report)
    }

    /// Tick with zero delta until no bounded work is left or `max_frames`
    /// frames have passed. Returns the number of frames ticked.
    pub fn run_until_idle(&mut self, max_frames: u64) -> Result<u64> {
        for ticked in 0..max_frames {
            let report = self.tick(self.clock.frame() + 1, 0.0)?;
            if !report.has_backlog() && !self.promises.has_pending_microtasks() {
                return Ok(ticked + 1);
            }
        }
        Ok(max_frames)
    }

    /// Apply new capacities to every module. The configuration is validated
    /// before any module changes.
    pub fn reconfigure(&mut self, config: RuntimeConfig) -> Result<()> {
        config.resolve(&self.context)?;
        for module in self.modules_mut() {
            module.reconfigure(&config)?;
        }
        self.config = config;
        Ok(())
    }

    pub fn optimize_gpu(&mut self, enable: bool) {
        self.gpu_hint = enable;
        for module in self.modules_mut() {
            module.optimize_gpu(enable);
        }
    }

    /// Resolve `promise` with `value` once the deferred deadline passes.
    /// Does nothing if the promise has settled or been released by then.
    pub fn resolve_after(
        &mut self,
        promise: PromiseHandle,
        options: DeferredOptions,
        value: Value,
    ) -> Result<JobHandle> {
        self.schedule_timeout(promise, options, Timeout::Resolve(value))
    }

    /// Reject `promise` with `diagnostics` once the deferred deadline passes
    pub fn reject_after(
        &mut self,
        promise: PromiseHandle,
        options: DeferredOptions,
        diagnostics: impl Into<String>,
    ) -> Result<JobHandle> {
        let diagnostics = diagnostics.into();
        if diagnostics.is_empty() {
            return Err(Error::invalid_argument(crate::error::messages::EMPTY_DIAGNOSTICS));
        }
        self.schedule_timeout(promise, options, Timeout::Reject(diagnostics))
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            version: crate::VERSION,
            frame: self.clock.frame(),
            elapsed_seconds: self.clock.elapsed_seconds(),
            gpu_hint: self.gpu_hint,
            capacities: *self.promises.capacities(),
            promises: PromiseTelemetry::collect(&self.promises),
            streams: StreamTelemetry::collect(&self.streams),
            deferred: DeferredTelemetry::collect(&self.deferred),
        }
    }

    pub fn promises(&self) -> &PromiseRegistry {
        &self.promises
    }

    pub fn promises_mut(&mut self) -> &mut PromiseRegistry {
        &mut self.promises
    }

    pub fn streams(&self) -> &StreamEngine {
        &self.streams
    }

    pub fn streams_mut(&mut self) -> &mut StreamEngine {
        &mut self.streams
    }

    pub fn deferred(&self) -> &DeferredDispatcher {
        &self.deferred
    }

    pub fn deferred_mut(&mut self) -> &mut DeferredDispatcher {
        &mut self.deferred
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn context(&self) -> &HostContext {
        &self.context
    }

    pub fn capacities(&self) -> Capacities {
        *self.promises.capacities()
    }

    pub fn clock(&self) -> FrameClock {
        self.clock
    }

    fn modules_mut(&mut self) -> [&mut dyn RuntimeModule; 3] {
        [&mut self.deferred, &mut self.promises, &mut self.streams]
    }

    fn schedule_timeout(
        &mut self,
        promise: PromiseHandle,
        options: DeferredOptions,
        timeout: Timeout,
    ) -> Result<JobHandle> {
        // Surface a stale handle now rather than at the deadline.
        self.promises.state(promise)?;

        let outbox = Rc::clone(&self.timeouts);
        self.deferred.schedule(options, move |_| {
            outbox.borrow_mut().push((promise, timeout));
            Ok(())
        })
    }

    fn apply_timeouts(&mut self) -> usize {
        let due: Vec<_> = self.timeouts.borrow_mut().drain(..).collect();
        let mut applied = 0;
        for (promise, timeout) in due {
            let settled = match timeout {
                Timeout::Resolve(value) => self.promises.resolve(promise, value, ""),
                Timeout::Reject(diagnostics) => self.promises.reject(promise, diagnostics, Value::Undefined),
            };
            match settled {
                Ok(()) => applied += 1,
                Err(err) => trace!("timeout for {} skipped: {}", promise, err),
            }
        }
        if applied > 0 {
            debug!("applied {} promise timeouts", applied);
        }
        applied
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("clock", &self.clock)
            .field("gpu_hint", &self.gpu_hint)
            .field("promises", &self.promises)
            .field("streams", &self.streams)
            .field("deferred", &self.deferred)
            .finish()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let pending = self.promises.pending_microtasks();
        if pending > 0 {
            warn!("runtime dropped with {} microtasks still queued", pending);
        }
    }
}
