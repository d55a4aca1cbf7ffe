//! Microtask scheduler
//!
//! One FIFO of queued reactions per registry. Draining is budget-limited:
//! reactions queued while a drain is running join the back of the same queue
//! and only run in this call if budget remains, otherwise on a later tick.

use super::reaction::{CallbackResult, ReactionInput, Rejection, Settlement};
use super::{PromiseRegistry, PromiseState};
use crate::error::messages;
use crate::slot::Handle;
use serde::Serialize;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use tracing::{trace, warn};

/// FIFO of reaction handles awaiting execution
#[derive(Debug, Default)]
pub(crate) struct MicrotaskQueue {
    queue: VecDeque<Handle>,
}

impl MicrotaskQueue {
    pub fn push(&mut self, reaction: Handle) {
        self.queue.push_back(reaction);
    }

    pub fn pop(&mut self) -> Option<Handle> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Result of one [`PromiseRegistry::process_microtasks`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DrainReport {
    /// Queue entries consumed, including skipped orphans
    pub processed: usize,
    /// Derived promises fulfilled
    pub fulfilled: usize,
    /// Derived promises rejected
    pub rejected: usize,
    /// Reactions skipped because a promise they reference was released
    pub orphaned: usize,
    /// Entries left in the queue when the budget ran out
    pub remaining: usize,
}

impl PromiseRegistry {
    /// Run up to `budget` queued reactions in global FIFO order.
    ///
    /// No callback failure escapes: an `Err` or a panic rejects the
    /// reaction's derived promise and the loop moves on.
    pub fn process_microtasks(&mut self, budget: usize) -> DrainReport {
        let mut report = DrainReport::default();

        while report.processed < budget {
            let Some(reaction) = self.microtasks.pop() else {
                break;
            };
            report.processed += 1;
            self.run_reaction(reaction, &mut report);
        }

        report.remaining = self.microtasks.len();
        self.stats.microtasks_processed += report.processed as u64;
        if report.processed as u64 > self.stats.max_microtasks_per_drain {
            self.stats.max_microtasks_per_drain = report.processed as u64;
        }
        report
    }

    /// Number of reactions waiting in the queue
    pub fn pending_microtasks(&self) -> usize {
        self.microtasks.len()
    }

    pub fn has_pending_microtasks(&self) -> bool {
        !self.microtasks.is_empty()
    }

    fn run_reaction(&mut self, reaction: Handle, report: &mut DrainReport) {
        let mut record = match self.reactions.release(reaction) {
            Ok(record) => record,
            Err(err) => {
                warn!("queued reaction {} vanished: {}", reaction, err);
                self.stats.orphaned_reactions += 1;
                report.orphaned += 1;
                return;
            }
        };

        let source_live = self.promises.contains(record.source.handle());
        let derived_live = self.promises.contains(record.derived.handle());
        if !source_live || !derived_live {
            trace!(
                "skipping orphaned reaction {} (source {} live: {}, derived {} live: {})",
                reaction,
                record.source,
                source_live,
                record.derived,
                derived_live
            );
            self.stats.orphaned_reactions += 1;
            report.orphaned += 1;
            return;
        }

        let Some(settlement) = record.snapshot.take() else {
            warn!("reaction {} was queued without a settlement snapshot", reaction);
            self.stats.orphaned_reactions += 1;
            report.orphaned += 1;
            return;
        };

        let outcome = match record.take_callback(settlement.state) {
            Some(callback) => {
                let input = ReactionInput {
                    settlement: &settlement,
                    source: record.source,
                    derived: record.derived,
                    user_data: record.user_data,
                    frame: self.clock.frame(),
                };
                match panic::catch_unwind(AssertUnwindSafe(|| callback(&input))) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(rejection)) => {
                        self.stats.callback_failures += 1;
                        Err(rejection)
                    }
                    Err(payload) => {
                        self.stats.callback_panics += 1;
                        warn!("reaction callback for {} panicked", record.derived);
                        Err(Rejection::new(format!(
                            "{}: {}",
                            messages::CALLBACK_PANICKED,
                            panic_message(payload.as_ref())
                        )))
                    }
                }
            }
            None => pass_through(&settlement),
        };

        self.stats.reactions_run += 1;
        trace!("reaction {} settles {}", reaction, record.derived);

        let settled = match outcome {
            Ok(value) => {
                report.fulfilled += 1;
                self.resolve(record.derived, value, "")
            }
            Err(rejection) => {
                report.rejected += 1;
                let diagnostics = if rejection.diagnostics.is_empty() {
                    "rejected".to_string()
                } else {
                    rejection.diagnostics
                };
                self.reject(record.derived, diagnostics, rejection.value)
            }
        };
        if let Err(err) = settled {
            // The host may settle or cancel a derived promise itself.
            trace!("derived promise {} kept its state: {}", record.derived, err);
        }
    }
}

/// Settlement for a reaction that has no callback for the source's outcome
fn pass_through(settlement: &Settlement) -> CallbackResult {
    match settlement.state {
        PromiseState::Fulfilled => Ok(settlement.value.clone()),
        PromiseState::Rejected => Err(Rejection {
            diagnostics: settlement.diagnostics.clone(),
            value: settlement.value.clone(),
        }),
        PromiseState::Cancelled | PromiseState::Pending => Err(Rejection::new(messages::CANCELLED)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
