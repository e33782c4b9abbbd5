//! Backend driver error types.

use thiserror::Error;

/// Result type for backend driver operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors raised by a backend driver.
///
/// These describe what went wrong at the runtime boundary. The session layer
/// wraps them with the operation and backend variant that produced them.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The runtime CLI ran but reported failure.
    #[error("{command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// The runtime binary could not be spawned or the daemon did not answer.
    #[error("runtime unreachable ({binary}): {message}")]
    Unreachable { binary: String, message: String },

    /// The environment behind a handle is gone.
    #[error("environment not found: {0}")]
    NotFound(String),

    /// Image could not be resolved locally or pulled.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// A bounded wait expired.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// Failed to parse runtime output.
    #[error("failed to parse runtime output: {0}")]
    ParseError(String),

    /// No container runtime available.
    #[error("no container runtime available (docker or podman)")]
    NoRuntimeAvailable,

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Build a `CommandFailed` from captured stderr bytes.
    pub(crate) fn command_failed(command: impl Into<String>, stderr: &[u8]) -> Self {
        BackendError::CommandFailed {
            command: command.into(),
            message: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }
}
