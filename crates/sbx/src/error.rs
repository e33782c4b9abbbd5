//! Session error taxonomy.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backend::{BackendError, BackendVariant};
use crate::session::SessionState;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by the session manager.
///
/// Every variant carries enough context (operation, path, backend variant) to
/// act on it without looking at internals.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The environment could not be created.
    #[error("provisioning on {variant} failed: {source}")]
    Provision {
        variant: BackendVariant,
        #[source]
        source: BackendError,
    },

    /// Dependency installation failed; `output` holds the tool's diagnostics.
    #[error("installing {language} libraries failed (exit code {exit_code}): {output}")]
    Install {
        language: String,
        exit_code: i32,
        output: String,
    },

    /// Copy source is missing on the host.
    #[error("source not found on host: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Copy source is missing inside the environment.
    #[error("remote path not found on {variant}: {path}")]
    RemoteNotFound {
        variant: BackendVariant,
        path: String,
    },

    /// Runtime-level failure while running an operation. A non-zero exit code
    /// from the workload itself is never reported here.
    #[error("{operation} on {variant} failed: {source}")]
    Execution {
        operation: &'static str,
        variant: BackendVariant,
        #[source]
        source: BackendError,
    },

    /// An operation exceeded its bound.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// An operation was attempted against a session in the wrong state.
    #[error("cannot {operation} while session is {state}")]
    StateViolation {
        operation: &'static str,
        state: SessionState,
    },

    /// A remote path failed validation (traversal, outside permitted roots).
    #[error("invalid remote path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// Session configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Host-side transfer failure (archive build, extraction, rename).
    #[error("transfer of {} failed: {source}", path.display())]
    Transfer {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The environment could not be removed cleanly.
    #[error("teardown on {variant} failed: {source}")]
    Teardown {
        variant: BackendVariant,
        #[source]
        source: BackendError,
    },
}

impl SessionError {
    pub(crate) fn execution(
        operation: &'static str,
        variant: BackendVariant,
        source: BackendError,
    ) -> Self {
        SessionError::Execution {
            operation,
            variant,
            source,
        }
    }

    /// Whether the error leaves the environment unusable.
    ///
    /// Runtime-level failures (handle gone, runtime unreachable) and failed
    /// installs poison the session. Validation failures do not.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Provision { .. }
            | SessionError::Install { .. }
            | SessionError::Teardown { .. } => true,
            SessionError::Execution { source, .. } => matches!(
                source,
                BackendError::NotFound(_)
                    | BackendError::Unreachable { .. }
                    | BackendError::NoRuntimeAvailable
            ),
            _ => false,
        }
    }
}
