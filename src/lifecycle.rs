//! Uniform module lifecycle
//!
//! Every scheduling module exposes the same shape to the host:
//!
//! | Call | Effect |
//! |------|--------|
//! | `initialize` | one-time capacity wiring from the host context |
//! | `tick` | advance the frame clock and run bounded drains |
//! | `optimize_gpu` | record the hint for telemetry (no execution path) |
//! | `reconfigure` | apply new caps to future allocations only |

use crate::config::{HostContext, RuntimeConfig};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// What the host delivers once per frame
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameInfo {
    pub frame_index: u64,
    pub delta_seconds: f64,
}

impl FrameInfo {
    pub fn new(frame_index: u64, delta_seconds: f64) -> Self {
        Self {
            frame_index,
            delta_seconds,
        }
    }
}

/// Frame counter and accumulated seconds as seen by one module
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameClock {
    frame: u64,
    elapsed_seconds: f64,
}

impl FrameClock {
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed_seconds
    }

    /// Move the clock to `info.frame_index`, adding `info.delta_seconds`.
    /// Frames may repeat but never go backwards.
    pub fn advance(&mut self, info: FrameInfo) -> Result<()> {
        if !info.delta_seconds.is_finite() || info.delta_seconds < 0.0 {
            return Err(Error::invalid_argument(format!(
                "delta_seconds must be finite and non-negative, got {}",
                info.delta_seconds
            )));
        }
        if info.frame_index < self.frame {
            return Err(Error::invalid_argument(format!(
                "frame index went backwards: {} after {}",
                info.frame_index, self.frame
            )));
        }
        self.frame = info.frame_index;
        self.elapsed_seconds += info.delta_seconds;
        Ok(())
    }
}

/// Work accounting returned from a module tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TickReport {
    /// Items processed during this tick
    pub processed: usize,
    /// Items still waiting after the budget ran out
    pub remaining: usize,
}

/// Lifecycle every scheduling module implements
pub trait RuntimeModule {
    /// Stable module name used in logs and telemetry
    fn name(&self) -> &'static str;

    /// One-time wiring of capacities from the host context.
    /// Calling it a second time is an `InvalidArgument`.
    fn initialize(&mut self, context: &HostContext, config: &RuntimeConfig) -> Result<()>;

    /// Advance the frame clock and perform this module's bounded drain
    fn tick(&mut self, frame: FrameInfo) -> Result<TickReport>;

    /// Record the GPU hint. Nothing in the core offloads work.
    fn optimize_gpu(&mut self, enable: bool);

    /// Apply new capacities to future allocations; live handles stay valid
    fn reconfigure(&mut self, config: &RuntimeConfig) -> Result<()>;
}
