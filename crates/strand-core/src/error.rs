//! Error types for strand
//!
//! Only recoverable conditions are errors. Misuse of the local-storage
//! contracts (accessing execution-local storage outside a context, freeing
//! an index twice, clearing a shared context) panics instead.

use core::fmt;

/// Result type for strand operations
pub type StrandResult<T> = Result<T, StrandError>;

/// Errors that can occur in strand operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrandError {
    /// Runtime has not been initialized
    NotInitialized,

    /// Runtime already initialized
    AlreadyInitialized,

    /// Runtime was shut down, no new fibers are accepted
    ShutDown,

    /// Configuration rejected by `validate()`
    InvalidConfig(&'static str),

    /// Could not start a carrier thread for a new fiber
    SpawnFailed,

    /// Work queue no longer accepts items
    QueueStopped,

    /// Deadline passed before the operation completed
    Timeout,
}

impl fmt::Display for StrandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrandError::NotInitialized => write!(f, "runtime not initialized"),
            StrandError::AlreadyInitialized => write!(f, "runtime already initialized"),
            StrandError::ShutDown => write!(f, "runtime shut down"),
            StrandError::InvalidConfig(reason) => write!(f, "invalid configuration: {}", reason),
            StrandError::SpawnFailed => write!(f, "failed to spawn carrier thread"),
            StrandError::QueueStopped => write!(f, "work queue stopped"),
            StrandError::Timeout => write!(f, "operation timed out"),
        }
    }
}

impl std::error::Error for StrandError {}

impl From<std::io::Error> for StrandError {
    fn from(_: std::io::Error) -> Self {
        StrandError::SpawnFailed
    }
}
