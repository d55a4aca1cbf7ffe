//! Prelude module for convenient imports
//!
//! ```
//! use mercury::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let mut runtime = Runtime::with_defaults()?;
//!     let stream = runtime.streams_mut().create_stream(StreamOptions::new())?;
//!     runtime.streams_mut().enqueue(stream, Entry::value("hello"), false)?;
//!     runtime.tick(1, 0.016)?;
//!     Ok(())
//! }
//! ```

// Core
pub use crate::error::{Error, Result, Status};
pub use crate::runtime::{FrameReport, Runtime};
pub use crate::value::Value;

// Host surface
pub use crate::config::{HostContext, HostFeatures, RuntimeConfig};
pub use crate::lifecycle::{FrameInfo, RuntimeModule, TickReport};

// Promises
pub use crate::promise::{
    PromiseHandle, PromiseRegistry, PromiseState, ReactionOptions, Rejection,
};

// Streams
pub use crate::stream::{
    EnqueueOutcome, Entry, NextResult, StreamEngine, StreamHandle, StreamOptions, Ticket,
};

// Deferred callbacks
pub use crate::deferred::{DeferredDispatcher, DeferredOptions, JobHandle};

// Telemetry
pub use crate::telemetry::TelemetrySnapshot;
