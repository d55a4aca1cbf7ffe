//! Async stream rendezvous
//!
//! Each stream pairs a bounded value queue with a bounded waiter queue.
//! Producers call [`StreamEngine::enqueue`]; consumers call
//! [`StreamEngine::request_next`]. Whichever side arrives second completes
//! the rendezvous:
//!
//! - a value arriving while a consumer waits is handed to the oldest waiter
//!   and parked in the stream's settled ring until the host collects it with
//!   [`StreamEngine::drain_settled`];
//! - a request arriving while values are queued is answered immediately.
//!
//! Nothing is ever overwritten or dropped to make room: a full queue or a
//! full waiter list turns the call into `CapacityExceeded`.
//!
//! ## States
//!
//! ```text
//! Active --complete/fail--> Closing --queue drained--> Completed | Failed
//!   |                          |
//!   +--(queue empty)-----------+--------------------> Completed | Failed
//!   +--cancel_stream--> Cancelled
//! ```
//!
//! When a stream reaches a terminal state every outstanding waiter receives
//! the terminal result (`done = true`); later requests get it immediately.

mod ring;

use crate::config::{Capacities, HostContext, RuntimeConfig};
use crate::error::{messages, Error, ResourceKind, Result, Status};
use crate::lifecycle::{FrameClock, FrameInfo, RuntimeModule, TickReport};
use crate::slot::{typed_handle, SlotAllocator};
use crate::value::Value;
use ring::BoundedQueue;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace, warn};

typed_handle!(
    /// Handle to a stream in a [`StreamEngine`]
    StreamHandle
);

/// Identifier of one consumer request, unique within its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ticket(pub u64);

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ticket-{}", self.0)
    }
}

impl From<Ticket> for u64 {
    fn from(ticket: Ticket) -> Self {
        ticket.0
    }
}

/// Stream lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamState {
    Active,
    /// Completion or failure was signalled while values were still queued
    Closing,
    Completed,
    Failed,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamState::Completed | StreamState::Failed | StreamState::Cancelled
        )
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Active => write!(f, "active"),
            StreamState::Closing => write!(f, "closing"),
            StreamState::Completed => write!(f, "completed"),
            StreamState::Failed => write!(f, "failed"),
            StreamState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A produced item or a terminal marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub value: Value,
    pub done: bool,
    pub status: Status,
    pub diagnostics: String,
}

impl Entry {
    /// An ordinary item
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            done: false,
            status: Status::Ok,
            diagnostics: String::new(),
        }
    }

    /// End-of-stream marker
    pub fn done() -> Self {
        Self {
            value: Value::Undefined,
            done: true,
            status: Status::Ok,
            diagnostics: String::new(),
        }
    }

    /// Failure marker; `status` should not be `Ok`
    pub fn failure(status: Status, diagnostics: impl Into<String>) -> Self {
        Self {
            value: Value::Undefined,
            done: true,
            status,
            diagnostics: diagnostics.into(),
        }
    }

    /// Whether this entry ends the stream rather than carrying an item
    pub fn is_terminal(&self) -> bool {
        self.done || !self.status.is_ok()
    }
}

#[derive(Debug, Clone)]
struct Waiter {
    ticket: Ticket,
    label: String,
    request_frame: u64,
    request_seconds: f64,
}

/// What a consumer receives
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamResult {
    pub ticket: Ticket,
    pub entry: Entry,
    /// `true` when the request was answered in the same call
    pub immediate: bool,
    /// Label the consumer gave the request
    pub label: String,
    pub request_frame: u64,
    pub request_seconds: f64,
    pub delivered_frame: u64,
}

/// Outcome of [`StreamEngine::request_next`]
#[derive(Debug, Clone, PartialEq)]
pub enum NextResult {
    /// Answered in the same call
    Ready(StreamResult),
    /// Registered as a waiter; collect with `drain_settled`
    Pending(Ticket),
}

impl NextResult {
    pub fn is_ready(&self) -> bool {
        matches!(self, NextResult::Ready(_))
    }

    pub fn ticket(&self) -> Ticket {
        match self {
            NextResult::Ready(result) => result.ticket,
            NextResult::Pending(ticket) => *ticket,
        }
    }
}

/// Outcome of [`StreamEngine::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Handed straight to the waiter holding this ticket
    Delivered(Ticket),
    /// Stored in the value queue
    Queued,
    /// The entry was a terminal marker and closed the stream
    Closed,
}

/// Options for [`StreamEngine::create_stream`]. Zero capacities take the
/// engine's configured defaults.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub queue_capacity: usize,
    pub waiter_capacity: usize,
    pub label: String,
}

impl StreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn waiter_capacity(mut self, capacity: usize) -> Self {
        self.waiter_capacity = capacity;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Read-only view of a stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSnapshot {
    pub state: StreamState,
    pub queued: usize,
    pub waiting: usize,
    pub settled: usize,
    pub capacity: usize,
    pub waiter_capacity: usize,
    pub terminal_status: Status,
    pub terminal_diagnostics: String,
    pub label: String,
}

/// Counters exported with telemetry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    pub streams_created: u64,
    pub streams_destroyed: u64,
    /// `create_stream` refused because the stream pool was full
    pub stream_overflow: u64,
    pub entries_enqueued: u64,
    pub urgent_entries: u64,
    /// Entries handed directly to a waiting consumer
    pub entries_delivered: u64,
    /// Requests answered in the same call
    pub immediate_results: u64,
    pub queue_overflow: u64,
    pub waiter_overflow: u64,
    pub waiters_registered: u64,
    /// Waiters answered with a terminal result
    pub waiters_flushed: u64,
    pub tickets_cancelled: u64,
    /// Queued entries thrown away by `cancel_stream`/`destroy_stream`
    pub entries_discarded: u64,
    pub results_drained: u64,
    pub ticks: u64,
}

struct StreamSlot {
    state: StreamState,
    /// Terminal state to enter once `Closing` has drained its queue
    closing_target: StreamState,
    queue: BoundedQueue<Entry>,
    waiters: BoundedQueue<Waiter>,
    settled: BoundedQueue<StreamResult>,
    waiter_capacity: usize,
    ticket_counter: u64,
    terminal_status: Status,
    terminal_diagnostics: String,
    label: String,
}

impl StreamSlot {
    fn new(queue_capacity: usize, waiter_capacity: usize, label: String) -> Self {
        Self {
            state: StreamState::Active,
            closing_target: StreamState::Completed,
            queue: BoundedQueue::with_capacity(queue_capacity),
            waiters: BoundedQueue::with_capacity(waiter_capacity),
            settled: BoundedQueue::with_capacity(waiter_capacity),
            waiter_capacity,
            ticket_counter: 0,
            terminal_status: Status::Ok,
            terminal_diagnostics: String::new(),
            label,
        }
    }

    fn next_ticket(&mut self) -> Ticket {
        self.ticket_counter += 1;
        Ticket(self.ticket_counter)
    }

    /// Requests issued but not yet collected by the host
    fn outstanding(&self) -> usize {
        self.waiters.len() + self.settled.len()
    }

    fn terminal_entry(&self) -> Entry {
        Entry {
            value: Value::Undefined,
            done: true,
            status: self.terminal_status,
            diagnostics: self.terminal_diagnostics.clone(),
        }
    }

    /// Answer every waiter with the terminal entry. Returns how many were
    /// flushed.
    fn flush_waiters(&mut self, frame: u64) -> Result<usize> {
        let terminal = self.terminal_entry();
        let mut flushed = 0;
        while let Some(waiter) = self.waiters.pop_front() {
            self.deliver(waiter, terminal.clone(), frame)?;
            flushed += 1;
        }
        Ok(flushed)
    }

    fn deliver(&mut self, waiter: Waiter, entry: Entry, frame: u64) -> Result<()> {
        let result = StreamResult {
            ticket: waiter.ticket,
            entry,
            immediate: false,
            label: waiter.label,
            request_frame: waiter.request_frame,
            request_seconds: waiter.request_seconds,
            delivered_frame: frame,
        };
        self.settled
            .push_back(result)
            .map_err(|_| Error::internal("settled ring overflowed its waiter budget"))
    }
}

/// All async streams of one runtime
pub struct StreamEngine {
    streams: SlotAllocator<StreamSlot>,
    clock: FrameClock,
    context: HostContext,
    capacities: Capacities,
    initialized: bool,
    gpu_hint: bool,
    stats: StreamStats,
}

impl Default for StreamEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamEngine {
    /// Create an engine sized from the default host context
    pub fn new() -> Self {
        let context = HostContext::default();
        let capacities = RuntimeConfig::default()
            .resolve(&context)
            .unwrap_or_default();
        Self::with_capacities(context, capacities)
    }

    pub fn with_capacities(context: HostContext, capacities: Capacities) -> Self {
        Self {
            streams: SlotAllocator::new(ResourceKind::Stream, capacities.stream_capacity),
            clock: FrameClock::default(),
            context,
            capacities,
            initialized: false,
            gpu_hint: false,
            stats: StreamStats::default(),
        }
    }

    /// Build and initialize an engine from host configuration
    pub fn from_config(context: &HostContext, config: &RuntimeConfig) -> Result<Self> {
        let mut engine = Self::with_capacities(context.clone(), config.resolve(context)?);
        engine.initialized = true;
        Ok(engine)
    }

    pub fn create_stream(&mut self, options: StreamOptions) -> Result<StreamHandle> {
        let queue_capacity = match options.queue_capacity {
            0 => self.capacities.queue_capacity,
            n => n,
        };
        let waiter_capacity = match options.waiter_capacity {
            0 => self.capacities.waiter_capacity,
            n => n,
        };

        let slot = StreamSlot::new(queue_capacity, waiter_capacity, options.label);
        match self.streams.acquire(slot) {
            Ok(handle) => {
                self.stats.streams_created += 1;
                debug!(
                    "created stream {} (queue {}, waiters {})",
                    handle, queue_capacity, waiter_capacity
                );
                Ok(StreamHandle(handle))
            }
            Err(err) => {
                self.stats.stream_overflow += 1;
                warn!("stream pool exhausted: {}", err);
                Err(err)
            }
        }
    }

    /// Release a stream together with its queue and waiter storage.
    /// Outstanding waiters are dropped without an answer.
    pub fn destroy_stream(&mut self, stream: StreamHandle) -> Result<()> {
        let slot = self.streams.release(stream.0)?;
        self.stats.streams_destroyed += 1;
        self.stats.entries_discarded += slot.queue.len() as u64;
        if !slot.waiters.is_empty() {
            debug!(
                "destroyed {} with {} waiters outstanding",
                stream,
                slot.waiters.len()
            );
        }
        Ok(())
    }

    /// Offer an entry to the stream.
    ///
    /// The oldest waiter, if any, receives it directly. Otherwise the entry
    /// joins the queue, at the front when `urgent`. A full queue is
    /// `CapacityExceeded` whether or not the entry is urgent; nothing is
    /// evicted. Terminal entries (`done`, or a non-`Ok` status) close the
    /// stream as [`signal_complete`](Self::signal_complete) or
    /// [`fail`](Self::fail) would.
    pub fn enqueue(
        &mut self,
        stream: StreamHandle,
        entry: Entry,
        urgent: bool,
    ) -> Result<EnqueueOutcome> {
        if entry.is_terminal() {
            let target = if entry.status.is_ok() {
                StreamState::Completed
            } else {
                StreamState::Failed
            };
            self.close(stream, target, entry.status, entry.diagnostics)?;
            return Ok(EnqueueOutcome::Closed);
        }

        let frame = self.clock.frame();
        let slot = self.streams.get_mut(stream.0)?;
        if slot.state != StreamState::Active {
            return Err(Error::invalid_argument(format!(
                "{}: {} is {}",
                messages::STREAM_TERMINAL,
                stream,
                slot.state
            )));
        }

        if let Some(waiter) = slot.waiters.pop_front() {
            let ticket = waiter.ticket;
            slot.deliver(waiter, entry, frame)?;
            self.stats.entries_enqueued += 1;
            self.stats.entries_delivered += 1;
            trace!("entry delivered to {} of {}", ticket, stream);
            return Ok(EnqueueOutcome::Delivered(ticket));
        }

        let pushed = if urgent {
            slot.queue.push_front(entry)
        } else {
            slot.queue.push_back(entry)
        };
        match pushed {
            Ok(()) => {
                self.stats.entries_enqueued += 1;
                if urgent {
                    self.stats.urgent_entries += 1;
                }
                Ok(EnqueueOutcome::Queued)
            }
            Err(_) => {
                let limit = slot.queue.capacity();
                self.stats.queue_overflow += 1;
                warn!("queue of {} is full ({} entries)", stream, limit);
                Err(Error::capacity_exceeded(ResourceKind::Queue, limit))
            }
        }
    }

    /// Ask for the next entry.
    ///
    /// Queued entries are returned immediately; on an empty queue the request
    /// becomes a waiter (or `CapacityExceeded` when the stream already has
    /// `waiter_capacity` requests outstanding). Terminal streams answer
    /// immediately with their terminal result.
    pub fn request_next(&mut self, stream: StreamHandle, label: impl Into<String>) -> Result<NextResult> {
        let frame = self.clock.frame();
        let seconds = self.clock.elapsed_seconds();
        let slot = self.streams.get_mut(stream.0)?;
        let label = label.into();

        let immediate = |ticket, entry| StreamResult {
            ticket,
            entry,
            immediate: true,
            label: String::new(),
            request_frame: frame,
            request_seconds: seconds,
            delivered_frame: frame,
        };

        if slot.state.is_terminal() {
            let ticket = slot.next_ticket();
            let mut result = immediate(ticket, slot.terminal_entry());
            result.label = label;
            self.stats.immediate_results += 1;
            return Ok(NextResult::Ready(result));
        }

        if let Some(entry) = slot.queue.pop_front() {
            let ticket = slot.next_ticket();
            if slot.state == StreamState::Closing && slot.queue.is_empty() {
                slot.state = slot.closing_target;
                debug!("{} drained its queue and is now {}", stream, slot.state);
            }
            let mut result = immediate(ticket, entry);
            result.label = label;
            self.stats.immediate_results += 1;
            return Ok(NextResult::Ready(result));
        }

        if slot.outstanding() >= slot.waiter_capacity {
            let limit = slot.waiter_capacity;
            self.stats.waiter_overflow += 1;
            warn!("{} already has {} requests outstanding", stream, limit);
            return Err(Error::capacity_exceeded(ResourceKind::Waiter, limit));
        }

        let ticket = slot.next_ticket();
        slot.waiters
            .push_back(Waiter {
                ticket,
                label,
                request_frame: frame,
                request_seconds: seconds,
            })
            .map_err(|_| Error::internal("waiter ring full below its outstanding limit"))?;
        self.stats.waiters_registered += 1;
        trace!("{} waits on {}", ticket, stream);
        Ok(NextResult::Pending(ticket))
    }

    /// Mark the stream complete. Waiters receive `done = true`; if entries
    /// are still queued the stream stays `Closing` until they are consumed.
    pub fn signal_complete(&mut self, stream: StreamHandle) -> Result<()> {
        self.close(stream, StreamState::Completed, Status::Ok, String::new())
    }

    /// Fail the stream with a non-`Ok` status and diagnostics
    pub fn fail(
        &mut self,
        stream: StreamHandle,
        status: Status,
        diagnostics: impl Into<String>,
    ) -> Result<()> {
        if status.is_ok() {
            return Err(Error::invalid_argument("fail requires a non-Ok status"));
        }
        self.close(stream, StreamState::Failed, status, diagnostics.into())
    }

    /// Cancel the stream: queued entries are discarded and every waiter
    /// receives a `Cancelled` terminal result. `Ok(false)` if the stream had
    /// already reached a terminal state.
    pub fn cancel_stream(&mut self, stream: StreamHandle) -> Result<bool> {
        let frame = self.clock.frame();
        let slot = self.streams.get_mut(stream.0)?;
        if slot.state.is_terminal() {
            return Ok(false);
        }

        let discarded = slot.queue.drain().count();
        slot.state = StreamState::Cancelled;
        slot.terminal_status = Status::Cancelled;
        slot.terminal_diagnostics = messages::CANCELLED.to_string();
        let flushed = slot.flush_waiters(frame)?;

        self.stats.entries_discarded += discarded as u64;
        self.stats.waiters_flushed += flushed as u64;
        debug!("cancelled {} ({} discarded, {} flushed)", stream, discarded, flushed);
        Ok(true)
    }

    /// Withdraw a still-pending request. `Ok(false)` when the ticket was
    /// already served or never existed.
    pub fn cancel_ticket(&mut self, stream: StreamHandle, ticket: Ticket) -> Result<bool> {
        let slot = self.streams.get_mut(stream.0)?;
        let removed = slot.waiters.remove_first(|w| w.ticket == ticket).is_some();
        if removed {
            self.stats.tickets_cancelled += 1;
        }
        Ok(removed)
    }

    /// Collect up to `max` results delivered to waiters, oldest first
    pub fn drain_settled(&mut self, stream: StreamHandle, max: usize) -> Result<Vec<StreamResult>> {
        let slot = self.streams.get_mut(stream.0)?;
        let mut drained = Vec::with_capacity(max.min(slot.settled.len()));
        while drained.len() < max {
            match slot.settled.pop_front() {
                Some(result) => drained.push(result),
                None => break,
            }
        }
        self.stats.results_drained += drained.len() as u64;
        Ok(drained)
    }

    pub fn state(&self, stream: StreamHandle) -> Result<StreamState> {
        Ok(self.streams.get(stream.0)?.state)
    }

    pub fn contains(&self, stream: StreamHandle) -> bool {
        self.streams.contains(stream.0)
    }

    pub fn snapshot(&self, stream: StreamHandle) -> Result<StreamSnapshot> {
        let slot = self.streams.get(stream.0)?;
        Ok(StreamSnapshot {
            state: slot.state,
            queued: slot.queue.len(),
            waiting: slot.waiters.len(),
            settled: slot.settled.len(),
            capacity: slot.queue.capacity(),
            waiter_capacity: slot.waiter_capacity,
            terminal_status: slot.terminal_status,
            terminal_diagnostics: slot.terminal_diagnostics.clone(),
            label: slot.label.clone(),
        })
    }

    pub fn live_streams(&self) -> usize {
        self.streams.len()
    }

    /// Undrained results across every stream
    pub fn pending_results(&self) -> usize {
        self.streams.iter().map(|(_, slot)| slot.settled.len()).sum()
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

    pub fn stats(&self) -> StreamStats {
        self.stats.clone()
    }

    pub fn reset_stats(&mut self) {
        self.stats = StreamStats::default();
    }

    fn close(
        &mut self,
        stream: StreamHandle,
        target: StreamState,
        status: Status,
        diagnostics: String,
    ) -> Result<()> {
        let frame = self.clock.frame();
        let slot = self.streams.get_mut(stream.0)?;
        if slot.state != StreamState::Active {
            return Err(Error::invalid_argument(messages::invalid_in_state(
                "closing a stream",
                slot.state,
            )));
        }

        slot.terminal_status = status;
        slot.terminal_diagnostics = diagnostics;
        if slot.queue.is_empty() {
            slot.state = target;
            let flushed = slot.flush_waiters(frame)?;
            self.stats.waiters_flushed += flushed as u64;
            debug!("{} is {} ({} waiters flushed)", stream, target, flushed);
        } else {
            slot.state = StreamState::Closing;
            slot.closing_target = target;
            debug!(
                "{} closing with {} entries still queued",
                stream,
                slot.queue.len()
            );
        }
        Ok(())
    }
}

impl RuntimeModule for StreamEngine {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn initialize(&mut self, context: &HostContext, config: &RuntimeConfig) -> Result<()> {
        if self.initialized {
            return Err(Error::invalid_argument("stream engine is already initialized"));
        }
        let capacities = config.resolve(context)?;
        self.context = context.clone();
        self.apply(capacities);
        self.initialized = true;
        debug!(
            "stream engine initialized: {} streams, queue {}, waiters {}",
            capacities.stream_capacity, capacities.queue_capacity, capacities.waiter_capacity
        );
        Ok(())
    }

    /// Streams deliver at enqueue time, so a tick only moves the clock and
    /// reports how many results are waiting to be drained.
    fn tick(&mut self, frame: FrameInfo) -> Result<TickReport> {
        self.clock.advance(frame)?;
        self.stats.ticks += 1;
        Ok(TickReport {
            processed: 0,
            remaining: self.pending_results(),
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

impl StreamEngine {
    /// Queue and waiter capacities only apply to streams created afterwards
    fn apply(&mut self, capacities: Capacities) {
        self.streams.set_max_slots(capacities.stream_capacity);
        self.capacities = capacities;
    }
}

impl fmt::Debug for StreamEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamEngine")
            .field("live_streams", &self.streams.len())
            .field("clock", &self.clock)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> StreamEngine {
        StreamEngine::new()
    }

    fn stream(engine: &mut StreamEngine, queue: usize, waiters: usize) -> StreamHandle {
        engine
            .create_stream(
                StreamOptions::new()
                    .queue_capacity(queue)
                    .waiter_capacity(waiters)
                    .label("test"),
            )
            .unwrap()
    }

    fn ready(result: NextResult) -> StreamResult {
        match result {
            NextResult::Ready(result) => result,
            NextResult::Pending(ticket) => panic!("expected an immediate result, got {}", ticket),
        }
    }

    #[test]
    fn test_rendezvous_with_capacity_one() {
        let mut eng = engine();
        let s = stream(&mut eng, 1, 4);

        assert_eq!(eng.enqueue(s, Entry::value("A"), false).unwrap(), EnqueueOutcome::Queued);
        let first = ready(eng.request_next(s, "first").unwrap());
        assert!(first.immediate);
        assert_eq!(first.entry.value, Value::from("A"));

        let pending = eng.request_next(s, "second").unwrap();
        let NextResult::Pending(ticket) = pending else {
            panic!("expected a pending ticket");
        };

        assert_eq!(
            eng.enqueue(s, Entry::value("B"), false).unwrap(),
            EnqueueOutcome::Delivered(ticket)
        );
        let settled = eng.drain_settled(s, 8).unwrap();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].ticket, ticket);
        assert_eq!(settled[0].entry.value, Value::from("B"));
        assert!(!settled[0].immediate);
        assert_eq!(settled[0].label, "second");
    }

    #[test]
    fn test_full_queue_is_capacity_exceeded() {
        let mut eng = engine();
        let s = stream(&mut eng, 1, 1);
        eng.enqueue(s, Entry::value(1), false).unwrap();
        let err = eng.enqueue(s, Entry::value(2), false).unwrap_err();
        assert_eq!(err.status(), Status::CapacityExceeded);
        assert_eq!(eng.snapshot(s).unwrap().queued, 1);
        assert_eq!(eng.stats().queue_overflow, 1);
    }

    #[test]
    fn test_urgent_jumps_queue_but_never_evicts() {
        let mut eng = engine();
        let s = stream(&mut eng, 2, 1);
        eng.enqueue(s, Entry::value("normal"), false).unwrap();
        eng.enqueue(s, Entry::value("urgent"), true).unwrap();

        let err = eng.enqueue(s, Entry::value("late urgent"), true).unwrap_err();
        assert_eq!(err.status(), Status::CapacityExceeded);

        assert_eq!(ready(eng.request_next(s, "").unwrap()).entry.value, Value::from("urgent"));
        assert_eq!(ready(eng.request_next(s, "").unwrap()).entry.value, Value::from("normal"));
    }

    #[test]
    fn test_waiter_capacity() {
        let mut eng = engine();
        let s = stream(&mut eng, 1, 2);
        eng.request_next(s, "a").unwrap();
        eng.request_next(s, "b").unwrap();
        let err = eng.request_next(s, "c").unwrap_err();
        assert_eq!(err.status(), Status::CapacityExceeded);
        assert_eq!(eng.stats().waiter_overflow, 1);
    }

    #[test]
    fn test_undrained_results_count_against_waiters() {
        let mut eng = engine();
        let s = stream(&mut eng, 1, 1);
        eng.request_next(s, "a").unwrap();
        eng.enqueue(s, Entry::value(1), false).unwrap();

        assert!(eng.request_next(s, "b").is_err());
        eng.drain_settled(s, 1).unwrap();
        assert!(eng.request_next(s, "b").is_ok());
    }

    #[test]
    fn test_terminal_flush() {
        let mut eng = engine();
        let s = stream(&mut eng, 1, 4);
        eng.request_next(s, "a").unwrap();
        eng.request_next(s, "b").unwrap();
        eng.signal_complete(s).unwrap();

        let settled = eng.drain_settled(s, 8).unwrap();
        assert_eq!(settled.len(), 2);
        assert!(settled.iter().all(|r| r.entry.done));
        assert_eq!(eng.state(s).unwrap(), StreamState::Completed);
    }

    #[test]
    fn test_closing_drains_queue_first() {
        let mut eng = engine();
        let s = stream(&mut eng, 4, 4);
        eng.enqueue(s, Entry::value(1), false).unwrap();
        eng.enqueue(s, Entry::value(2), false).unwrap();
        eng.signal_complete(s).unwrap();
        assert_eq!(eng.state(s).unwrap(), StreamState::Closing);

        let err = eng.enqueue(s, Entry::value(3), false).unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);

        assert_eq!(ready(eng.request_next(s, "").unwrap()).entry.value, Value::from(1));
        assert_eq!(eng.state(s).unwrap(), StreamState::Closing);
        assert_eq!(ready(eng.request_next(s, "").unwrap()).entry.value, Value::from(2));
        assert_eq!(eng.state(s).unwrap(), StreamState::Completed);
        assert!(ready(eng.request_next(s, "").unwrap()).entry.done);
    }

    #[test]
    fn test_fail_reports_status() {
        let mut eng = engine();
        let s = stream(&mut eng, 1, 1);
        eng.request_next(s, "a").unwrap();
        eng.fail(s, Status::InvalidArgument, "bad chunk").unwrap();

        let settled = eng.drain_settled(s, 1).unwrap();
        assert_eq!(settled[0].entry.status, Status::InvalidArgument);
        assert_eq!(settled[0].entry.diagnostics, "bad chunk");
        assert_eq!(eng.state(s).unwrap(), StreamState::Failed);
        assert!(eng.fail(s, Status::Ok, "x").is_err());
    }

    #[test]
    fn test_terminal_entries_close_the_stream() {
        let mut eng = engine();
        let done = stream(&mut eng, 1, 1);
        assert_eq!(eng.enqueue(done, Entry::done(), false).unwrap(), EnqueueOutcome::Closed);
        assert_eq!(eng.state(done).unwrap(), StreamState::Completed);

        let failed = stream(&mut eng, 1, 1);
        eng.enqueue(failed, Entry::failure(Status::InternalError, "producer died"), false)
            .unwrap();
        assert_eq!(eng.state(failed).unwrap(), StreamState::Failed);

        let err = eng.enqueue(done, Entry::value(1), false).unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
    }

    #[test]
    fn test_cancel_ticket_is_idempotent() {
        let mut eng = engine();
        let s = stream(&mut eng, 1, 4);
        let a = eng.request_next(s, "a").unwrap().ticket();
        let b = eng.request_next(s, "b").unwrap().ticket();

        assert!(eng.cancel_ticket(s, a).unwrap());
        assert!(!eng.cancel_ticket(s, a).unwrap());
        assert!(!eng.cancel_ticket(s, Ticket(999)).unwrap());

        assert_eq!(eng.enqueue(s, Entry::value(1), false).unwrap(), EnqueueOutcome::Delivered(b));
        assert!(!eng.cancel_ticket(s, b).unwrap());
    }

    #[test]
    fn test_cancel_stream_flushes_and_discards() {
        let mut eng = engine();
        let s = stream(&mut eng, 2, 2);
        eng.request_next(s, "a").unwrap();
        assert!(eng.cancel_stream(s).unwrap());
        assert!(!eng.cancel_stream(s).unwrap());

        let settled = eng.drain_settled(s, 4).unwrap();
        assert_eq!(settled.len(), 1);
        assert!(settled[0].entry.done);
        assert_eq!(settled[0].entry.status, Status::Cancelled);
        assert_eq!(eng.state(s).unwrap(), StreamState::Cancelled);
    }

    #[test]
    fn test_destroy_invalidates_handle() {
        let mut eng = engine();
        let s = stream(&mut eng, 1, 1);
        eng.enqueue(s, Entry::value(1), false).unwrap();
        eng.destroy_stream(s).unwrap();

        assert_eq!(eng.request_next(s, "").unwrap_err().status(), Status::NotFound);
        assert_eq!(eng.destroy_stream(s).unwrap_err().status(), Status::NotFound);
        assert_eq!(eng.stats().entries_discarded, 1);
        assert_eq!(eng.live_streams(), 0);
    }

    #[test]
    fn test_waiters_served_in_fifo_order() {
        let mut eng = engine();
        let s = stream(&mut eng, 1, 3);
        let tickets: Vec<_> = (0..3)
            .map(|i| eng.request_next(s, format!("w{}", i)).unwrap().ticket())
            .collect();
        for i in 0..3 {
            eng.enqueue(s, Entry::value(i), false).unwrap();
        }
        let settled = eng.drain_settled(s, 8).unwrap();
        let order: Vec<_> = settled.iter().map(|r| r.ticket).collect();
        assert_eq!(order, tickets);
        assert_eq!(settled[2].entry.value, Value::from(2));
    }

    #[test]
    fn test_results_are_frame_stamped() {
        let mut eng = engine();
        let s = stream(&mut eng, 1, 1);
        eng.tick(FrameInfo::new(1, 0.1)).unwrap();
        eng.request_next(s, "a").unwrap();
        eng.tick(FrameInfo::new(4, 0.3)).unwrap();
        eng.enqueue(s, Entry::value(1), false).unwrap();

        let result = eng.drain_settled(s, 1).unwrap().remove(0);
        assert_eq!(result.request_frame, 1);
        assert_eq!(result.delivered_frame, 4);
    }
}
