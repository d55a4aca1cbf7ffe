//! Mercury: a frame-driven async scheduling core
//!
//! Mercury gives an embedding host (a game loop, a UI toolkit, an engine
//! plug-in) promises, async streams and deferred callbacks without threads or
//! an executor. All asynchrony is deferral: work becomes runnable during host
//! calls and only runs when the host ticks the runtime once per frame, with a
//! budget on how much runs per tick.
//!
//! # Quick Start
//!
//! ```
//! use mercury::promise::ReactionOptions;
//! use mercury::{Runtime, Value};
//!
//! fn main() -> mercury::Result<()> {
//!     let mut runtime = Runtime::with_defaults()?;
//!     let promises = runtime.promises_mut();
//!     let source = promises.create_promise("load")?;
//!     let doubled = promises.then(
//!         source,
//!         ReactionOptions::new().on_fulfilled(|input| {
//!             Ok(Value::from(input.value().as_number().unwrap_or(0.0) * 2.0))
//!         }),
//!     )?;
//!     promises.resolve(source, Value::from(21), "")?;
//!
//!     runtime.tick(1, 1.0 / 60.0)?;
//!     assert_eq!(runtime.promises().snapshot(doubled)?.value, Value::from(42));
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Storage** | [`slot`], [`value`] |
//! | **Scheduling** | [`promise`], [`stream`], [`deferred`] |
//! | **Host surface** | [`lifecycle`], [`config`], [`runtime`], [`telemetry`], [`error`](Error) |

pub mod config;
pub mod deferred;
pub mod lifecycle;
pub mod prelude;
pub mod promise;
pub mod runtime;
pub mod slot;
pub mod stream;
pub mod telemetry;
pub mod value;

mod error;

pub use error::{messages, Error, ResourceKind, Result, Status};
pub use runtime::Runtime;
pub use value::Value;

/// Mercury version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
