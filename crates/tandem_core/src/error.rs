//! # Core Error Types
//!
//! All recoverable errors that can occur in the command queue and object
//! sync layers. Thread-affinity misuse is not represented here: it is a
//! programmer error and is caught by debug assertions instead.

use thiserror::Error;

use crate::thread::DispatcherState;

/// Errors that can occur while talking to the core thread.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// The dispatcher is not accepting work (shutdown has begun or finished).
    #[error("core thread is not running (state: {0:?})")]
    NotRunning(DispatcherState),

    /// `start()` was called on a dispatcher that already left `NotStarted`.
    #[error("core thread already started")]
    AlreadyStarted,

    /// The OS refused to spawn the worker thread.
    #[error("failed to spawn core thread: {0}")]
    SpawnFailed(String),

    /// The operation would deadlock if run on the calling thread.
    #[error("operation not allowed on this thread: {0}")]
    WrongThread(&'static str),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    ConfigIo(String),
}

/// Result type for core thread operations.
pub type CoreResult<T> = Result<T, CoreError>;
