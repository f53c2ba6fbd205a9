//! Error types for filesystem watching
//!
//! Every fault the library reports, whether raised synchronously at a call
//! site or delivered later through the error category, is a [`WatchError`].
//! The type is `Clone` so one fault can be fanned out to any number of error
//! handlers and channels.

use std::convert::Infallible;
use std::fmt;
use thiserror::Error;

use crate::event::ChangeKind;

/// What went wrong on the native side of a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeFaultKind {
    /// The OS dropped notifications (internal buffer overflow, rescan required)
    Overflow,
    /// The watched path disappeared or became inaccessible
    PathInvalid,
    /// Anything else the backend reported
    Other,
}

impl fmt::Display for NativeFaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NativeFaultKind::Overflow => "overflow",
            NativeFaultKind::PathInvalid => "path invalid",
            NativeFaultKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Main error type for watch operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    /// Queue capacity below one
    #[error("The bounding capacity must be at least 1. Given: {capacity}")]
    InvalidCapacity { capacity: i64 },

    /// Change-reason mask carries bits that are not known flags
    #[error("Invalid change reason mask {bits:#x}: contains unknown flags")]
    InvalidChangeReasons { bits: u32 },

    /// A required argument was missing or malformed
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A handle was enabled without a path to watch
    #[error("No path has been set on the watch handle")]
    MissingPath,

    /// The internal event queue was full when a notification arrived
    #[error("{message}")]
    BufferExhausted { capacity: usize, message: String },

    /// The native watch facility reported a fault
    #[error("Native watch fault ({kind}): {message}")]
    Native { kind: NativeFaultKind, message: String },

    /// A registered handler panicked while an event was dispatched
    #[error("Handler for {category:?} events panicked: {message}")]
    HandlerPanicked { category: ChangeKind, message: String },

    /// The channels were completed by a previous stop
    #[error("Unable to start raising events again. The channels have been completed.")]
    AlreadyCompleted,

    /// The watcher has been disposed
    #[error("The watcher has been disposed")]
    Disposed,

    /// Raising was requested outside of a tokio runtime
    #[error("A tokio runtime is required to raise events")]
    RuntimeUnavailable,

    /// Configuration could not be read or parsed
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl WatchError {
    /// Build the overflow fault for a queue of the given capacity
    pub fn buffer_exhausted(capacity: usize) -> Self {
        WatchError::BufferExhausted {
            capacity,
            message: format!(
                "File system event queue buffer exhausted. {capacity} events exceeded."
            ),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        WatchError::InvalidArgument { message: message.into() }
    }

    pub fn native(kind: NativeFaultKind, message: impl Into<String>) -> Self {
        WatchError::Native { kind, message: message.into() }
    }

    /// Capacity that was exceeded, for overflow faults
    pub fn capacity(&self) -> Option<usize> {
        match self {
            WatchError::BufferExhausted { capacity, .. } => Some(*capacity),
            _ => None,
        }
    }

    pub fn is_buffer_exhausted(&self) -> bool {
        matches!(self, WatchError::BufferExhausted { .. })
    }

    /// Programmer errors raised at the point of misconfiguration
    pub fn is_configuration_fault(&self) -> bool {
        matches!(
            self,
            WatchError::InvalidCapacity { .. }
                | WatchError::InvalidChangeReasons { .. }
                | WatchError::InvalidArgument { .. }
                | WatchError::MissingPath
                | WatchError::Config { .. }
        )
    }

    /// Misuse of a watcher's lifecycle
    pub fn is_lifecycle_fault(&self) -> bool {
        matches!(
            self,
            WatchError::AlreadyCompleted | WatchError::Disposed | WatchError::RuntimeUnavailable
        )
    }
}

impl From<notify::Error> for WatchError {
    fn from(error: notify::Error) -> Self {
        let kind = match &error.kind {
            notify::ErrorKind::PathNotFound | notify::ErrorKind::WatchNotFound => {
                NativeFaultKind::PathInvalid
            }
            notify::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                NativeFaultKind::PathInvalid
            }
            notify::ErrorKind::MaxFilesWatch => NativeFaultKind::Overflow,
            _ => NativeFaultKind::Other,
        };
        WatchError::native(kind, error.to_string())
    }
}

impl From<Infallible> for WatchError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

impl From<glob_utils::FilterError> for WatchError {
    fn from(error: glob_utils::FilterError) -> Self {
        WatchError::invalid_argument(format!("invalid name filter: {error}"))
    }
}

impl From<toml::de::Error> for WatchError {
    fn from(error: toml::de::Error) -> Self {
        WatchError::Config { message: error.to_string() }
    }
}

/// Result type for watch operations
pub type Result<T> = std::result::Result<T, WatchError>;
