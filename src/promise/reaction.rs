//! Reaction records
//!
//! A reaction is the `(on_fulfilled, on_rejected)` pair registered by
//! [`PromiseRegistry::then`](super::PromiseRegistry::then). Records live in
//! their own slot pool and are linked per source promise through `next`,
//! forming a FIFO in attachment order.

use super::{PromiseHandle, PromiseState};
use crate::slot::Handle;
use crate::value::Value;
use std::fmt;

/// Frozen view of a source promise's settlement
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub state: PromiseState,
    pub value: Value,
    pub diagnostics: String,
}

/// What a callback returns when it wants the derived promise rejected
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub diagnostics: String,
    pub value: Value,
}

impl Rejection {
    pub fn new(diagnostics: impl Into<String>) -> Self {
        Self {
            diagnostics: diagnostics.into(),
            value: Value::Undefined,
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = value;
        self
    }
}

/// Outcome of a reaction callback: `Ok` fulfills the derived promise,
/// `Err` rejects it.
pub type CallbackResult = std::result::Result<Value, Rejection>;

/// Arguments handed to a reaction callback
#[derive(Debug)]
pub struct ReactionInput<'a> {
    /// Source settlement as it was when the reaction was queued
    pub settlement: &'a Settlement,
    pub source: PromiseHandle,
    pub derived: PromiseHandle,
    /// Opaque word supplied at attachment time
    pub user_data: u64,
    /// Frame in which the reaction runs
    pub frame: u64,
}

impl ReactionInput<'_> {
    pub fn value(&self) -> &Value {
        &self.settlement.value
    }

    pub fn diagnostics(&self) -> &str {
        &self.settlement.diagnostics
    }
}

/// A boxed reaction callback. Runs at most once.
pub type ReactionFn = Box<dyn FnOnce(&ReactionInput<'_>) -> CallbackResult>;

/// Options for [`PromiseRegistry::then`](super::PromiseRegistry::then)
///
/// ```
/// use mercury::promise::ReactionOptions;
///
/// let options = ReactionOptions::new()
///     .on_fulfilled(|input| Ok(input.value().clone()))
///     .label("identity")
///     .user_data(7);
/// # let _ = options;
/// ```
#[derive(Default)]
pub struct ReactionOptions {
    pub(crate) on_fulfilled: Option<ReactionFn>,
    pub(crate) on_rejected: Option<ReactionFn>,
    pub(crate) label: String,
    pub(crate) user_data: u64,
}

impl ReactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_fulfilled<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&ReactionInput<'_>) -> CallbackResult + 'static,
    {
        self.on_fulfilled = Some(Box::new(callback));
        self
    }

    pub fn on_rejected<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&ReactionInput<'_>) -> CallbackResult + 'static,
    {
        self.on_rejected = Some(Box::new(callback));
        self
    }

    /// Label for the derived promise
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn user_data(mut self, user_data: u64) -> Self {
        self.user_data = user_data;
        self
    }
}

impl fmt::Debug for ReactionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactionOptions")
            .field("on_fulfilled", &self.on_fulfilled.is_some())
            .field("on_rejected", &self.on_rejected.is_some())
            .field("label", &self.label)
            .field("user_data", &self.user_data)
            .finish()
    }
}

/// A registered reaction waiting for its source to settle
pub(crate) struct ReactionRecord {
    pub source: PromiseHandle,
    pub derived: PromiseHandle,
    pub on_fulfilled: Option<ReactionFn>,
    pub on_rejected: Option<ReactionFn>,
    pub user_data: u64,
    /// Next reaction of the same source, in attachment order
    pub next: Option<Handle>,
    /// Set when the reaction is queued; never re-read from the live source
    pub snapshot: Option<Settlement>,
}

impl ReactionRecord {
    pub fn new(source: PromiseHandle, derived: PromiseHandle, options: ReactionOptions) -> Self {
        Self {
            source,
            derived,
            on_fulfilled: options.on_fulfilled,
            on_rejected: options.on_rejected,
            user_data: options.user_data,
            next: None,
            snapshot: None,
        }
    }

    /// Pick the callback matching the frozen settlement
    pub fn take_callback(&mut self, state: PromiseState) -> Option<ReactionFn> {
        match state {
            PromiseState::Fulfilled => self.on_fulfilled.take(),
            PromiseState::Rejected | PromiseState::Cancelled => self.on_rejected.take(),
            PromiseState::Pending => None,
        }
    }
}

impl fmt::Debug for ReactionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactionRecord")
            .field("source", &self.source)
            .field("derived", &self.derived)
            .field("user_data", &self.user_data)
            .field("next", &self.next)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}
