//! Deferred callback dispatch
//!
//! Frame-quantized timeouts. A job becomes eligible once both the frame
//! counter and the accumulated seconds reach its deadline; eligibility is
//! only checked during `tick`, so a job never fires between frames.

use crate::config::{Capacities, HostContext, RuntimeConfig};
use crate::error::{messages, Error, ResourceKind, Result};
use crate::lifecycle::{FrameClock, FrameInfo, RuntimeModule, TickReport};
use crate::slot::{typed_handle, SlotAllocator};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, trace, warn};

typed_handle!(
    /// Handle to a scheduled job in a [`DeferredDispatcher`]
    JobHandle
);

/// What a job sees when it runs
#[derive(Debug, Clone, Copy)]
pub struct JobContext<'a> {
    pub job: JobHandle,
    pub label: &'a str,
    /// Frame the job actually ran in
    pub frame: u64,
    pub elapsed_seconds: f64,
    /// Frames between the deadline and the actual run
    pub frames_late: u64,
}

/// A job reports failure with a diagnostic
pub type JobFn = Box<dyn FnOnce(&JobContext<'_>) -> std::result::Result<(), String>>;

/// When a job should run, relative to the moment it is scheduled
#[derive(Debug, Clone, Default)]
pub struct DeferredOptions {
    pub delay_frames: u64,
    pub delay_seconds: f64,
    pub label: String,
}

impl DeferredOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay_frames(mut self, frames: u64) -> Self {
        self.delay_frames = frames;
        self
    }

    pub fn delay_seconds(mut self, seconds: f64) -> Self {
        self.delay_seconds = seconds;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Counters exported with telemetry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredStats {
    pub scheduled: u64,
    pub fired: u64,
    pub cancelled: u64,
    /// Jobs that returned an error
    pub failed: u64,
    pub panicked: u64,
    /// `schedule` refused because the job pool was full
    pub overflow: u64,
    /// Ticks that left eligible jobs behind because of the dispatch budget
    pub budget_exhausted: u64,
    pub ticks: u64,
}

/// Result of one dispatch pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DispatchReport {
    pub fired: usize,
    pub failed: usize,
    /// Eligible jobs left for the next tick
    pub deferred: usize,
}

struct Job {
    deadline_frame: u64,
    deadline_seconds: f64,
    sequence: u64,
    label: String,
    callback: JobFn,
}

impl Job {
    fn is_due(&self, clock: &FrameClock) -> bool {
        clock.frame() >= self.deadline_frame && clock.elapsed_seconds() >= self.deadline_seconds
    }

    fn order(&self, other: &Job) -> Ordering {
        self.deadline_frame
            .cmp(&other.deadline_frame)
            .then(self.deadline_seconds.total_cmp(&other.deadline_seconds))
            .then(self.sequence.cmp(&other.sequence))
    }
}

/// Pending deferred jobs of one runtime
pub struct DeferredDispatcher {
    jobs: SlotAllocator<Job>,
    clock: FrameClock,
    context: HostContext,
    capacities: Capacities,
    next_sequence: u64,
    initialized: bool,
    gpu_hint: bool,
    stats: DeferredStats,
}

impl Default for DeferredDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredDispatcher {
    pub fn new() -> Self {
        let context = HostContext::default();
        let capacities = RuntimeConfig::default()
            .resolve(&context)
            .unwrap_or_default();
        Self::with_capacities(context, capacities)
    }

    pub fn with_capacities(context: HostContext, capacities: Capacities) -> Self {
        Self {
            jobs: SlotAllocator::new(ResourceKind::Job, capacities.deferred_capacity),
            clock: FrameClock::default(),
            context,
            capacities,
            next_sequence: 0,
            initialized: false,
            gpu_hint: false,
            stats: DeferredStats::default(),
        }
    }

    pub fn from_config(context: &HostContext, config: &RuntimeConfig) -> Result<Self> {
        let mut dispatcher = Self::with_capacities(context.clone(), config.resolve(context)?);
        dispatcher.initialized = true;
        Ok(dispatcher)
    }

    /// Schedule `job` to run once its deadline has passed.
    ///
    /// A zero delay makes the job eligible on the next tick, never inside
    /// this call.
    pub fn schedule<F>(&mut self, options: DeferredOptions, job: F) -> Result<JobHandle>
    where
        F: FnOnce(&JobContext<'_>) -> std::result::Result<(), String> + 'static,
    {
        if !options.delay_seconds.is_finite() || options.delay_seconds < 0.0 {
            return Err(Error::invalid_argument(format!(
                "delay_seconds must be finite and non-negative, got {}",
                options.delay_seconds
            )));
        }

        self.next_sequence += 1;
        let record = Job {
            deadline_frame: self.clock.frame().saturating_add(options.delay_frames),
            deadline_seconds: self.clock.elapsed_seconds() + options.delay_seconds,
            sequence: self.next_sequence,
            label: options.label,
            callback: Box::new(job),
        };
        let deadline = record.deadline_frame;

        match self.jobs.acquire(record) {
            Ok(handle) => {
                self.stats.scheduled += 1;
                trace!("scheduled job {} for frame {}", handle, deadline);
                Ok(JobHandle(handle))
            }
            Err(err) => {
                self.stats.overflow += 1;
                warn!("deferred job pool exhausted: {}", err);
                Err(err)
            }
        }
    }

    /// Drop a pending job. `Ok(false)` when it already ran or was cancelled.
    pub fn cancel(&mut self, job: JobHandle) -> Result<bool> {
        match self.jobs.release(job.0) {
            Ok(record) => {
                self.stats.cancelled += 1;
                debug!("cancelled job {} ({})", job, record.label);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    pub fn is_pending(&self, job: JobHandle) -> bool {
        self.jobs.contains(job.0)
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Run up to `budget` due jobs, earliest deadline first
    pub fn dispatch(&mut self, budget: usize) -> DispatchReport {
        let mut due: Vec<_> = self
            .jobs
            .iter()
            .filter(|(_, job)| job.is_due(&self.clock))
            .collect();
        due.sort_by(|(_, a), (_, b)| a.order(b));
        let due: Vec<_> = due.into_iter().map(|(handle, _)| handle).collect();

        let mut report = DispatchReport::default();
        for handle in due.iter().take(budget).copied() {
            let Ok(job) = self.jobs.release(handle) else {
                continue;
            };
            let context = JobContext {
                job: JobHandle(handle),
                label: &job.label,
                frame: self.clock.frame(),
                elapsed_seconds: self.clock.elapsed_seconds(),
                frames_late: self.clock.frame().saturating_sub(job.deadline_frame),
            };
            let callback = job.callback;
            match panic::catch_unwind(AssertUnwindSafe(|| callback(&context))) {
                Ok(Ok(())) => {}
                Ok(Err(diagnostics)) => {
                    self.stats.failed += 1;
                    report.failed += 1;
                    warn!("job {} ({}) failed: {}", handle, job.label, diagnostics);
                }
                Err(_) => {
                    self.stats.panicked += 1;
                    report.failed += 1;
                    warn!("job {} ({}): {}", handle, job.label, messages::CALLBACK_PANICKED);
                }
            }
            self.stats.fired += 1;
            report.fired += 1;
        }

        report.deferred = due.len().saturating_sub(budget);
        if report.deferred > 0 {
            self.stats.budget_exhausted += 1;
            debug!("{} due jobs deferred to the next tick", report.deferred);
        }
        report
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

    pub fn stats(&self) -> DeferredStats {
        self.stats.clone()
    }

    pub fn reset_stats(&mut self) {
        self.stats = DeferredStats::default();
    }
}

impl RuntimeModule for DeferredDispatcher {
    fn name(&self) -> &'static str {
        "deferred"
    }

    fn initialize(&mut self, context: &HostContext, config: &RuntimeConfig) -> Result<()> {
        if self.initialized {
            return Err(Error::invalid_argument("deferred dispatcher is already initialized"));
        }
        let capacities = config.resolve(context)?;
        self.context = context.clone();
        self.jobs.set_max_slots(capacities.deferred_capacity);
        self.capacities = capacities;
        self.initialized = true;
        Ok(())
    }

    fn tick(&mut self, frame: FrameInfo) -> Result<TickReport> {
        self.clock.advance(frame)?;
        self.stats.ticks += 1;
        let report = self.dispatch(self.capacities.dispatch_budget);
        Ok(TickReport {
            processed: report.fired,
            remaining: report.deferred,
        })
    }

    fn optimize_gpu(&mut self, enable: bool) {
        self.gpu_hint = enable;
    }

    fn reconfigure(&mut self, config: &RuntimeConfig) -> Result<()> {
        let capacities = config.resolve(&self.context)?;
        self.jobs.set_max_slots(capacities.deferred_capacity);
        self.capacities = capacities;
        Ok(())
    }
}

impl fmt::Debug for DeferredDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredDispatcher")
            .field("pending", &self.jobs.len())
            .field("clock", &self.clock)
            .finish()
    }
}
