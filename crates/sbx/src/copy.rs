//! Copy engine.
//!
//! Moves one file or directory tree per call across the host/environment
//! boundary. All checks that need no remote I/O (source exists and is
//! readable, remote path is well-formed and inside a permitted root) run
//! first, so an invalid request never touches the environment. The transfer
//! itself replaces the destination as a whole: data lands in a hidden sibling
//! and is renamed into place once complete.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::validate::{is_within_roots, normalize_remote_path, split_parent};
use crate::backend::{BackendError, BackendHandle, SandboxBackend};
use crate::error::{SessionError, SessionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyDirection {
    ToRuntime,
    FromRuntime,
}

impl std::fmt::Display for CopyDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyDirection::ToRuntime => write!(f, "copy_to_runtime"),
            CopyDirection::FromRuntime => write!(f, "copy_from_runtime"),
        }
    }
}

/// One copy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOperation {
    pub direction: CopyDirection,
    pub local: PathBuf,
    pub remote: String,
}

impl CopyOperation {
    pub fn to_runtime(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            direction: CopyDirection::ToRuntime,
            local: local.into(),
            remote: remote.into(),
        }
    }

    pub fn from_runtime(remote: impl Into<String>, local: impl Into<PathBuf>) -> Self {
        Self {
            direction: CopyDirection::FromRuntime,
            local: local.into(),
            remote: remote.into(),
        }
    }

    pub(crate) fn operation(&self) -> &'static str {
        match self.direction {
            CopyDirection::ToRuntime => "copy_to_runtime",
            CopyDirection::FromRuntime => "copy_from_runtime",
        }
    }

    /// Host-side checks. Returns the normalized remote path.
    ///
    /// Writes into the environment must land below one of `allowed_roots`.
    /// Reads may come from anywhere in the environment.
    pub fn validate(&self, workdir: &str, allowed_roots: &[String]) -> SessionResult<String> {
        if self.direction == CopyDirection::ToRuntime {
            check_source(&self.local)?;
        }

        let remote = normalize_remote_path(&self.remote, workdir).map_err(|e| {
            SessionError::InvalidPath {
                path: self.remote.clone(),
                reason: match e {
                    BackendError::InvalidInput(reason) => reason,
                    other => other.to_string(),
                },
            }
        })?;

        if split_parent(&remote).is_none() {
            return Err(SessionError::InvalidPath {
                path: self.remote.clone(),
                reason: "the filesystem root cannot be copied".to_string(),
            });
        }

        if self.direction == CopyDirection::ToRuntime && !is_within_roots(&remote, allowed_roots)
        {
            return Err(SessionError::InvalidPath {
                path: self.remote.clone(),
                reason: format!(
                    "'{}' is outside the permitted roots ({})",
                    remote,
                    allowed_roots.join(", ")
                ),
            });
        }

        Ok(remote)
    }

    /// Run the transfer. `remote` must come from [`CopyOperation::validate`].
    pub(crate) async fn perform(
        &self,
        backend: &dyn SandboxBackend,
        handle: &BackendHandle,
        remote: &str,
    ) -> SessionResult<()> {
        let result = match self.direction {
            CopyDirection::ToRuntime => backend.stage_in(handle, &self.local, remote).await,
            CopyDirection::FromRuntime => {
                let exists = backend
                    .path_exists(handle, remote)
                    .await
                    .map_err(|e| self.wrap(backend, e))?;
                if !exists {
                    return Err(SessionError::RemoteNotFound {
                        variant: backend.variant(),
                        path: remote.to_string(),
                    });
                }
                backend.stage_out(handle, remote, &self.local).await
            }
        };
        result.map_err(|e| self.wrap(backend, e))
    }

    fn wrap(&self, backend: &dyn SandboxBackend, error: BackendError) -> SessionError {
        match error {
            BackendError::Io(source) => SessionError::Transfer {
                path: self.local.clone(),
                source,
            },
            other => SessionError::execution(self.operation(), backend.variant(), other),
        }
    }
}

/// The source must exist and be readable before anything is staged.
fn check_source(path: &Path) -> SessionResult<()> {
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(SessionError::SourceNotFound {
                path: path.to_path_buf(),
            });
        }
        Err(source) => {
            return Err(SessionError::Transfer {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let readable = if metadata.is_dir() {
        std::fs::read_dir(path).map(|_| ())
    } else {
        std::fs::File::open(path).map(|_| ())
    };
    readable.map_err(|source| SessionError::Transfer {
        path: path.to_path_buf(),
        source,
    })
}
