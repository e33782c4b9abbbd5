//! Ephemeral sandbox sessions.
//!
//! Provisions an isolated environment on a local container engine (Docker or
//! Podman) or a Kubernetes cluster, moves files in and out of it, installs
//! language libraries, runs commands and removes the environment again.
//!
//! ```no_run
//! use sbx::{ExecutionRequest, SandboxSession, SessionConfig, SessionError};
//!
//! # async fn demo() -> Result<(), SessionError> {
//! let config = SessionConfig::default().with_libraries(["pandas"])?;
//! let exit_code = SandboxSession::scoped(config, |session| async move {
//!     session.copy_to_runtime("data.csv", "/sandbox/data.csv").await?;
//!     let result = session
//!         .execute(ExecutionRequest::shell("python -c 'import pandas'").timeout_secs(60))
//!         .await?;
//!     Ok::<_, SessionError>(result.exit_code)
//! })
//! .await?;
//! # let _ = exit_code;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod backend;
pub mod config;
pub mod copy;
pub mod error;
pub mod event;
pub mod exec;
pub mod install;
pub mod language;
pub mod session;

pub use backend::{
    BackendError, BackendHandle, BackendVariant, ClusterBackend, EngineBackend, RuntimeType,
    SandboxBackend,
};
pub use config::{ClusterConfig, ResourceLimits, SessionConfig};
pub use copy::{CopyDirection, CopyOperation};
pub use error::{SessionError, SessionResult};
pub use event::{EventKind, SessionEvent};
pub use exec::{CommandLine, ExecutionRequest, ExecutionResult};
pub use install::{LibraryRequirement, RuntimeEnvironment};
pub use language::Language;
pub use session::{SandboxSession, SessionState};
