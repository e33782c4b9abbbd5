//! Session orchestrator.
//!
//! A [`SandboxSession`] owns one environment from provisioning to teardown.
//! Copy and execution calls are serialized per session and only run while the
//! session is `Ready`; an unrecoverable runtime failure moves it to `Failed`,
//! after which only teardown is possible. [`SandboxSession::scoped`] ties the
//! environment's lifetime to a closure and removes it on every exit path.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::validate::normalize_remote_path;
use crate::backend::{
    self, BackendHandle, BackendVariant, EnvironmentSpec, ExecCommand, NAME_ALPHABET,
    SandboxBackend,
};
use crate::config::SessionConfig;
use crate::copy::CopyOperation;
use crate::error::{SessionError, SessionResult};
use crate::event::{EVENT_CHANNEL_CAPACITY, EventKind, SessionEvent};
use crate::exec::{self, CommandLine, ExecDefaults, ExecutionRequest, ExecutionResult};
use crate::install::{Installer, RuntimeEnvironment};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, nothing provisioned yet.
    Uninitialized,
    /// Environment is being created and prepared.
    Provisioning,
    /// Accepting copy and execution calls.
    Ready,
    /// A copy or execution call is in flight.
    Executing,
    /// The environment is being removed.
    TearingDown,
    /// Environment removed.
    Closed,
    /// Unrecoverable error; only teardown is allowed.
    Failed,
}

impl SessionState {
    /// Whether the state machine permits `self -> to`.
    fn allows(self, to: SessionState) -> bool {
        match self {
            SessionState::Closed => false,
            SessionState::TearingDown => to == SessionState::Closed,
            SessionState::Failed => to == SessionState::TearingDown,
            _ => true,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uninitialized => write!(f, "uninitialized"),
            SessionState::Provisioning => write!(f, "provisioning"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Executing => write!(f, "executing"),
            SessionState::TearingDown => write!(f, "tearing_down"),
            SessionState::Closed => write!(f, "closed"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "uninitialized" => Ok(SessionState::Uninitialized),
            "provisioning" => Ok(SessionState::Provisioning),
            "ready" => Ok(SessionState::Ready),
            "executing" => Ok(SessionState::Executing),
            "tearing_down" => Ok(SessionState::TearingDown),
            "closed" => Ok(SessionState::Closed),
            "failed" => Ok(SessionState::Failed),
            _ => Err(format!("unknown session state: {}", s)),
        }
    }
}

/// State guarded by the session's operation lock.
#[derive(Debug, Default)]
struct Inner {
    /// Set as soon as provisioning starts so teardown can find a partially
    /// created environment by its predicted name.
    handle: Option<BackendHandle>,
    runtime: Option<RuntimeEnvironment>,
}

/// One provisioned sandbox environment.
pub struct SandboxSession {
    id: Uuid,
    config: SessionConfig,
    backend: Arc<dyn SandboxBackend>,
    inner: Mutex<Inner>,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxSession")
            .field("id", &self.id)
            .field("backend", &self.backend.variant())
            .field("language", &self.config.language)
            .field("state", &self.state())
            .finish()
    }
}

impl SandboxSession {
    /// Create an unprovisioned session on `backend`.
    pub fn new(config: SessionConfig, backend: Arc<dyn SandboxBackend>) -> Self {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            config,
            backend,
            inner: Mutex::new(Inner::default()),
            state,
            events,
        }
    }

    /// Connect the configured backend and provision a session.
    ///
    /// On failure whatever was created is torn down before the error is
    /// returned.
    pub async fn open(config: SessionConfig) -> SessionResult<Self> {
        let backend = backend::connect(&config)?;
        Self::open_with_backend(config, backend).await
    }

    pub async fn open_with_backend(
        config: SessionConfig,
        backend: Arc<dyn SandboxBackend>,
    ) -> SessionResult<Self> {
        let session = Self::new(config, backend);
        if let Err(e) = session.provision().await {
            session.close_after_error().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Run `body` with a provisioned session and tear it down afterwards.
    ///
    /// Teardown runs when `body` returns, fails or panics (the panic resumes
    /// once the environment is gone). If the returned future is dropped early
    /// the last reference to the session schedules teardown on the runtime.
    pub async fn scoped<F, Fut, T, E>(config: SessionConfig, body: F) -> Result<T, E>
    where
        F: FnOnce(Arc<SandboxSession>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SessionError>,
    {
        let backend = backend::connect(&config)?;
        Self::scoped_with_backend(config, backend, body).await
    }

    pub async fn scoped_with_backend<F, Fut, T, E>(
        config: SessionConfig,
        backend: Arc<dyn SandboxBackend>,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Arc<SandboxSession>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SessionError>,
    {
        let session = Arc::new(Self::new(config, backend));
        if let Err(e) = session.provision().await {
            session.close_after_error().await;
            return Err(e.into());
        }

        let scope = Arc::clone(&session);
        let outcome = AssertUnwindSafe(async move { body(scope).await })
            .catch_unwind()
            .await;

        if let Err(e) = session.close().await {
            warn!(session = %session.id, "teardown after scope exit failed: {}", e);
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn variant(&self) -> BackendVariant {
        self.backend.variant()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Subscribe to session events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Handle of the live environment, once provisioned.
    pub async fn handle(&self) -> Option<BackendHandle> {
        self.inner.lock().await.handle.clone()
    }

    /// Interpreter and bin directory pinned during provisioning.
    pub async fn runtime_environment(&self) -> Option<RuntimeEnvironment> {
        self.inner.lock().await.runtime.clone()
    }

    /// Create the environment, prepare the language runtime and install the
    /// declared libraries.
    pub async fn provision(&self) -> SessionResult<()> {
        let mut inner = self.inner.lock().await;
        let state = self.state();
        if state != SessionState::Uninitialized {
            return Err(SessionError::StateViolation {
                operation: "provision",
                state,
            });
        }

        if let Err(e) = self.config.validate() {
            self.transition(SessionState::Failed);
            return Err(e);
        }

        self.transition(SessionState::Provisioning);
        let mut pending = PendingTransition::new(self, SessionState::Failed);
        let variant = self.backend.variant();

        let spec = self.environment_spec();
        inner.handle = Some(self.predicted_handle(&spec));

        let image = spec.image.clone();
        self.step(format_args!("provisioning {} on {}", image, variant));
        let handle = match self.backend.create(&spec).await {
            Ok(handle) => handle,
            Err(source) => {
                // The driver already removed whatever it created.
                inner.handle = None;
                return Err(self.fail(SessionError::Provision { variant, source }, &mut pending));
            }
        };
        inner.handle = Some(handle.clone());
        self.emit(EventKind::Provisioned {
            handle: handle.to_string(),
            image,
        });
        self.step(format_args!("environment {} created", handle));

        let installer = Installer::new(
            self.config.language,
            self.config.workdir.clone(),
            self.config.install_timeout(),
        );
        let runtime = match installer.prepare(self.backend.as_ref(), &handle).await {
            Ok(runtime) => runtime,
            Err(e) => return Err(self.fail(e, &mut pending)),
        };
        self.step(format_args!("using interpreter {}", runtime.interpreter));
        inner.runtime = Some(runtime.clone());

        if !self.config.libraries.is_empty() {
            let started = Instant::now();
            self.step(format_args!(
                "installing {} librar{}",
                self.config.libraries.len(),
                if self.config.libraries.len() == 1 { "y" } else { "ies" }
            ));
            let count = match installer
                .install(
                    self.backend.as_ref(),
                    &handle,
                    &runtime,
                    &self.config.libraries,
                )
                .await
            {
                Ok(count) => count,
                Err(e) => return Err(self.fail(e, &mut pending)),
            };
            self.emit(EventKind::LibrariesInstalled {
                count,
                elapsed: started.elapsed(),
            });
        }

        pending.disarm();
        self.transition(SessionState::Ready);
        info!(session = %self.id, handle = %handle, "session ready");
        Ok(())
    }

    /// Copy a host file or directory to `remote_path`, replacing it.
    pub async fn copy_to_runtime(
        &self,
        local_path: impl AsRef<Path>,
        remote_path: &str,
    ) -> SessionResult<()> {
        let op = CopyOperation::to_runtime(local_path.as_ref(), remote_path);
        self.copy(op).await
    }

    /// Copy `remote_path` (file or directory) to the host, replacing
    /// `local_path`.
    pub async fn copy_from_runtime(
        &self,
        remote_path: &str,
        local_path: impl AsRef<Path>,
    ) -> SessionResult<()> {
        let op = CopyOperation::from_runtime(remote_path, local_path.as_ref());
        self.copy(op).await
    }

    async fn copy(&self, op: CopyOperation) -> SessionResult<()> {
        let name = op.operation();
        self.operate(name, |handle, _| async move {
            let remote = op.validate(&self.config.workdir, &self.config.allowed_remote_roots)?;
            self.step(format_args!(
                "{}: {} <-> {}",
                name,
                op.local.display(),
                remote
            ));
            op.perform(self.backend.as_ref(), &handle, &remote).await?;
            self.emit(EventKind::Copied {
                direction: op.direction,
                local: op.local.clone(),
                remote,
            });
            Ok(())
        })
        .await
    }

    /// Run a command inside the environment.
    ///
    /// A non-zero exit code is a normal result. A command that exceeds its
    /// timeout is cancelled and reported with `timed_out` set.
    pub async fn execute(
        &self,
        request: impl Into<ExecutionRequest>,
    ) -> SessionResult<ExecutionResult> {
        let mut request = request.into();
        self.operate("execute", |handle, runtime| async move {
            if let Some(ref workdir) = request.workdir {
                let resolved = normalize_remote_path(workdir, &self.config.workdir).map_err(
                    |e| SessionError::InvalidPath {
                        path: workdir.clone(),
                        reason: e.to_string(),
                    },
                )?;
                request.workdir = Some(resolved);
            }
            self.run_request(&handle, runtime.as_ref(), request).await
        })
        .await
    }

    /// Shell command shorthand for [`SandboxSession::execute`].
    pub async fn execute_command(
        &self,
        command: &str,
        workdir: Option<&str>,
    ) -> SessionResult<ExecutionResult> {
        let mut request = ExecutionRequest::shell(command);
        if let Some(workdir) = workdir {
            request = request.workdir(workdir);
        }
        self.execute(request).await
    }

    /// Run `code` as a source file with the session's pinned interpreter.
    pub async fn run(&self, code: &str) -> SessionResult<ExecutionResult> {
        let language = self.config.language;
        let source = tempfile::Builder::new()
            .prefix("sbx-run-")
            .suffix(&format!(".{}", language.extension()))
            .tempfile()
            .and_then(|mut file| file.write_all(code.as_bytes()).map(|_| file))
            .map_err(|source| SessionError::Transfer {
                path: std::env::temp_dir(),
                source,
            })?;

        let remote = format!(
            "{}/.sbx/{}.{}",
            self.config.workdir.trim_end_matches('/'),
            nanoid::nanoid!(10, &NAME_ALPHABET),
            language.extension()
        );

        self.operate("run", |handle, runtime| async move {
            let Some(runtime) = runtime else {
                return Err(SessionError::StateViolation {
                    operation: "run",
                    state: SessionState::Uninitialized,
                });
            };
            self.backend
                .stage_in(&handle, source.path(), &remote)
                .await
                .map_err(|e| SessionError::execution("run", self.backend.variant(), e))?;

            let argv = language.run_argv(&runtime.interpreter, &remote);
            let request = ExecutionRequest {
                command: CommandLine::Argv(argv),
                timeout: None,
                workdir: None,
                env: BTreeMap::new(),
                merge_output: false,
            };
            let result = self.run_request(&handle, Some(&runtime), request).await;

            let cleanup = ExecCommand::new(["rm", "-f", remote.as_str()]);
            if let Err(e) = self.backend.exec(&handle, &cleanup).await {
                debug!(session = %self.id, "removing {} failed: {}", remote, e);
            }
            result
        })
        .await
    }

    async fn run_request(
        &self,
        handle: &BackendHandle,
        runtime: Option<&RuntimeEnvironment>,
        request: ExecutionRequest,
    ) -> SessionResult<ExecutionResult> {
        let defaults = ExecDefaults {
            workdir: &self.config.workdir,
            timeout: self.config.default_timeout(),
            env: &self.config.env,
            runtime,
        };
        self.step(format_args!("execute: {:?}", request.command));
        let result = exec::execute(self.backend.as_ref(), handle, request, &defaults)
            .await
            .map_err(|e| SessionError::execution("execute", self.backend.variant(), e))?;

        if result.timed_out {
            warn!(session = %self.id, elapsed = ?result.elapsed, "command timed out");
        } else {
            self.step(format_args!(
                "command exited with {} after {:?}",
                result.exit_code, result.elapsed
            ));
        }
        self.emit(EventKind::CommandFinished {
            exit_code: result.exit_code,
            timed_out: result.timed_out,
            elapsed: result.elapsed,
        });
        Ok(result)
    }

    /// Remove the environment. Later calls return `Ok`.
    ///
    /// The handle is only released once `destroy` has returned, so a close
    /// that is cancelled midway leaves the teardown to `Drop`.
    pub async fn close(&self) -> SessionResult<()> {
        let mut inner = self.inner.lock().await;
        if self.state() == SessionState::Closed {
            return Ok(());
        }

        self.transition(SessionState::TearingDown);
        inner.runtime = None;
        let result = match inner.handle.clone() {
            Some(handle) => {
                self.step(format_args!("removing environment {}", handle));
                let destroyed = self.backend.destroy(&handle).await.map_err(|source| {
                    SessionError::Teardown {
                        variant: self.backend.variant(),
                        source,
                    }
                });
                inner.handle = None;
                destroyed
            }
            None => Ok(()),
        };
        self.transition(SessionState::Closed);

        if let Err(ref e) = result {
            warn!(session = %self.id, "teardown failed: {}", e);
            self.emit(EventKind::TeardownWarning {
                message: e.to_string(),
            });
        }
        result
    }

    /// Teardown after a failed provision; the original error wins.
    async fn close_after_error(&self) {
        if let Err(e) = self.close().await {
            warn!(session = %self.id, "cleanup after failed provisioning: {}", e);
        }
    }

    /// Run `op` with the session marked `Executing`.
    ///
    /// The operation lock is held for the whole call, so concurrent calls
    /// queue up behind it.
    async fn operate<T, F, Fut>(&self, operation: &'static str, op: F) -> SessionResult<T>
    where
        F: FnOnce(BackendHandle, Option<RuntimeEnvironment>) -> Fut,
        Fut: Future<Output = SessionResult<T>>,
    {
        let inner = self.inner.lock().await;
        let state = self.state();
        let handle = match (&inner.handle, state) {
            (Some(handle), SessionState::Ready) => handle.clone(),
            _ => return Err(SessionError::StateViolation { operation, state }),
        };
        let runtime = inner.runtime.clone();

        self.transition(SessionState::Executing);
        let mut pending = PendingTransition::new(self, SessionState::Ready);
        let result = op(handle, runtime).await;
        pending.disarm();

        match &result {
            Err(e) if e.is_fatal() => {
                warn!(session = %self.id, operation, "session failed: {}", e);
                self.transition(SessionState::Failed);
            }
            _ => self.transition(SessionState::Ready),
        }
        drop(inner);
        result
    }

    fn environment_spec(&self) -> EnvironmentSpec {
        let mut labels = BTreeMap::new();
        labels.insert("sbx.backend".to_string(), self.backend.variant().to_string());
        EnvironmentSpec {
            session_id: self.id.simple().to_string(),
            image: self.config.effective_image(),
            language: self.config.language,
            workdir: self.config.workdir.clone(),
            resource_limits: self.config.resource_limits.clone(),
            env: self.config.env.clone(),
            labels,
        }
    }

    /// Handle the environment will get, used to clean up if provisioning is
    /// interrupted before `create` returns.
    fn predicted_handle(&self, spec: &EnvironmentSpec) -> BackendHandle {
        let handle = BackendHandle::new(spec.environment_name(), self.backend.variant());
        match self.backend.variant() {
            BackendVariant::ClusterOrchestrated => {
                handle.with_namespace(self.config.cluster.namespace.clone())
            }
            BackendVariant::ContainerEngineLocal => handle,
        }
    }

    fn fail(&self, error: SessionError, pending: &mut PendingTransition<'_>) -> SessionError {
        pending.disarm();
        warn!(session = %self.id, "provisioning failed: {}", error);
        self.transition(SessionState::Failed);
        error
    }

    fn transition(&self, to: SessionState) {
        let mut from = to;
        let changed = self.state.send_if_modified(|current| {
            if *current == to || !current.allows(to) {
                return false;
            }
            from = *current;
            *current = to;
            true
        });
        if changed {
            debug!(session = %self.id, "{} -> {}", from, to);
            self.emit(EventKind::StateChanged { from, to });
        }
    }

    fn emit(&self, kind: EventKind) {
        // No subscribers is fine.
        let _ = self.events.send(SessionEvent::new(self.id, kind));
    }

    /// Step-level diagnostics, promoted to info for verbose sessions.
    fn step(&self, message: fmt::Arguments<'_>) {
        if self.config.verbose {
            info!(session = %self.id, "{}", message);
        } else {
            debug!(session = %self.id, "{}", message);
        }
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        let Some(handle) = self.inner.get_mut().handle.take() else {
            return;
        };

        let backend = Arc::clone(&self.backend);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(session = %id, "session dropped without close, removing {}", handle);
                runtime.spawn(async move {
                    if let Err(e) = backend.destroy(&handle).await {
                        warn!(session = %id, "teardown of dropped session failed: {}", e);
                    }
                });
            }
            Err(_) => {
                warn!(
                    session = %id,
                    "session dropped outside a runtime; {} was not removed", handle
                );
            }
        }
    }
}

/// Applies a fallback state if the surrounding future is dropped before
/// [`PendingTransition::disarm`] is called.
struct PendingTransition<'a> {
    session: &'a SandboxSession,
    on_abort: SessionState,
    armed: bool,
}

impl<'a> PendingTransition<'a> {
    fn new(session: &'a SandboxSession, on_abort: SessionState) -> Self {
        Self {
            session,
            on_abort,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingTransition<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.session.transition(self.on_abort);
        }
    }
}
