//! Error types for the Mercury scheduling core
//!
//! Every fallible boundary operation returns [`Result`]. The machine-checkable
//! part of an error is its [`Status`]; the `Display` text is an advisory
//! diagnostic and is never meant to drive control flow.

use std::fmt;
use thiserror::Error;

/// Machine-checkable status code reported across the host boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Status {
    /// Operation succeeded
    Ok,
    /// Stale or unknown handle/ticket
    NotFound,
    /// Operation invalid given the current state
    InvalidArgument,
    /// Pool, queue or waiter limit reached
    CapacityExceeded,
    /// An invariant was violated (bug signal)
    InternalError,
    /// Target was cancelled before it produced a value
    Cancelled,
}

impl Status {
    /// Stable integer code for hosts that cannot carry Rust enums
    pub fn code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::NotFound => 1,
            Status::InvalidArgument => 2,
            Status::CapacityExceeded => 3,
            Status::InternalError => 4,
            Status::Cancelled => 5,
        }
    }

    /// Inverse of [`Status::code`]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Status::Ok),
            1 => Some(Status::NotFound),
            2 => Some(Status::InvalidArgument),
            3 => Some(Status::CapacityExceeded),
            4 => Some(Status::InternalError),
            5 => Some(Status::Cancelled),
            _ => None,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "Ok"),
            Status::NotFound => write!(f, "NotFound"),
            Status::InvalidArgument => write!(f, "InvalidArgument"),
            Status::CapacityExceeded => write!(f, "CapacityExceeded"),
            Status::InternalError => write!(f, "InternalError"),
            Status::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// The kind of pooled resource an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Promise,
    Reaction,
    Stream,
    Queue,
    Waiter,
    Ticket,
    Job,
    Slot,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Promise => write!(f, "promise"),
            ResourceKind::Reaction => write!(f, "reaction"),
            ResourceKind::Stream => write!(f, "stream"),
            ResourceKind::Queue => write!(f, "queue"),
            ResourceKind::Waiter => write!(f, "waiter"),
            ResourceKind::Ticket => write!(f, "ticket"),
            ResourceKind::Job => write!(f, "job"),
            ResourceKind::Slot => write!(f, "slot"),
        }
    }
}

/// Main error type for Mercury
#[derive(Error, Debug)]
pub enum Error {
    /// Stale or unknown handle/ticket
    #[error("NotFound: no live {kind} for handle {raw:#010x}")]
    NotFound { kind: ResourceKind, raw: u64 },

    /// Operation not valid in the target's current state
    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    /// A hard capacity limit was reached
    #[error("CapacityExceeded: {resource} limit of {limit} reached")]
    CapacityExceeded { resource: ResourceKind, limit: usize },

    /// An internal invariant was violated
    #[error("InternalError: {0}")]
    InternalError(String),

    /// Configuration could not be parsed or is inconsistent
    #[error("ConfigError: {0}")]
    Config(String),

    /// IO error while loading configuration
    #[error("IOError: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a NotFound error for a raw handle or ticket value
    pub fn not_found(kind: ResourceKind, raw: impl Into<u64>) -> Self {
        Error::NotFound {
            kind,
            raw: raw.into(),
        }
    }

    /// Create an InvalidArgument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    /// Create a CapacityExceeded error
    pub fn capacity_exceeded(resource: ResourceKind, limit: usize) -> Self {
        Error::CapacityExceeded { resource, limit }
    }

    /// Create an InternalError
    pub fn internal(message: impl Into<String>) -> Self {
        Error::InternalError(message.into())
    }

    /// The status code hosts branch on
    pub fn status(&self) -> Status {
        match self {
            Error::NotFound { .. } => Status::NotFound,
            Error::InvalidArgument(_) | Error::Config(_) => Status::InvalidArgument,
            Error::CapacityExceeded { .. } => Status::CapacityExceeded,
            Error::InternalError(_) | Error::Io { .. } => Status::InternalError,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias for Mercury
pub type Result<T> = std::result::Result<T, Error>;

/// Standardized diagnostic texts
pub mod messages {
    /// Diagnostic attached to reactions of a cancelled promise
    pub const CANCELLED: &str = "cancelled";
    pub const ALREADY_SETTLED: &str = "promise is already settled";
    pub const EMPTY_DIAGNOSTICS: &str = "rejection requires a non-empty diagnostic";
    pub const STREAM_TERMINAL: &str = "stream no longer accepts entries";
    pub const CALLBACK_PANICKED: &str = "callback panicked";

    /// Format an "X is not allowed in state Y" message
    pub fn invalid_in_state(what: &str, state: impl std::fmt::Display) -> String {
        format!("{} is not allowed in state {}", what, state)
    }
}
