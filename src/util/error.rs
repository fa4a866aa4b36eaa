//! Error types for the hybrid execution engine.
//!
//! Every GPU-facing operation returns [`Result`]; nothing panics across the
//! backend boundary. Variants follow four classes:
//! - capability errors (permanent for the component instance),
//! - resource exhaustion (recoverable after freeing memory),
//! - transient driver errors (numeric code embedded),
//! - logic errors (rejected before any native call).

use std::thread::ThreadId;
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Required hardware or driver feature is missing
    #[error("GPU capability unavailable: {0}")]
    Capability(String),

    /// Buffer count or memory budget exhausted
    #[error("GPU resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Native call reported an error code
    #[error("GPU driver error 0x{code:04X} during {operation}")]
    Driver { code: u32, operation: String },

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Second async dispatch while one is pending
    #[error("Async dispatch already in flight (fence {fence}); poll is_complete() first")]
    AsyncInFlight { fence: u64 },

    /// Requested work-group size/count exceeds the hardware limit
    #[error("Work group {axis}={requested} exceeds hardware maximum {max}")]
    WorkGroupTooLarge { axis: char, requested: u32, max: u32 },

    /// Transfer range outside buffer bounds
    #[error("Range {offset}+{len} out of bounds for buffer '{name}' ({size} bytes)")]
    OutOfBounds { name: String, offset: u64, len: u64, size: u64 },

    /// GPU call from a thread that does not own the context
    #[error("GPU call from thread {caller:?}, but context is owned by {owner:?}")]
    WrongThread { owner: ThreadId, caller: ThreadId },

    /// Shader compilation failed (native log verbatim)
    #[error("Shader compilation failed:\n{0}")]
    Compile(String),

    /// Program link failed (native log verbatim)
    #[error("Program link failed:\n{0}")]
    Link(String),

    /// Buffer not managed by this manager
    #[error("Unknown buffer: {0}")]
    UnknownBuffer(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Render was cancelled by the caller
    #[error("Render cancelled")]
    Cancelled,

    /// I/O error (message only; keeps the error `Clone`)
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an "other" error from a string.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a capability error.
    pub fn capability(msg: impl Into<String>) -> Self {
        Self::Capability(msg.into())
    }

    /// Capability errors are permanent: the caller must fall back to CPU.
    pub fn is_capability(&self) -> bool {
        matches!(self, Self::Capability(_))
    }

    /// Errors the caller may retry after freeing resources or waiting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted(_) | Self::Driver { .. } | Self::AsyncInFlight { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
