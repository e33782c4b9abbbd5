//! Test utilities and common setup.
//!
//! [`FakeBackend`] stands in for a container engine: every environment is a
//! directory under a host tempdir and commands run in the host shell with the
//! session workdir rewritten to that directory. Provisioning steps that would
//! need a language toolchain answer from canned responses.
#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sbx::backend::process::run_cli;
use sbx::backend::{BackendResult, EnvironmentSpec, ExecCommand, land_archive};
use sbx::{
    BackendError, BackendHandle, BackendVariant, ExecutionResult, SandboxBackend, SessionConfig,
};
use tempfile::TempDir;

/// Remote workdir used by every test session.
pub const WORKDIR: &str = "/sandbox";

/// Wraps the host command so it runs in `$0` with `K=V` pairs from `env`.
const HOST_WRAPPER: &str = r#"cd "$0" && exec env "$@""#;

#[derive(Debug)]
pub struct FakeBackend {
    root: TempDir,
    interpreter: String,
    install_failure: Mutex<Option<String>>,
    create_failure: Mutex<Option<String>>,
    create_delay: Mutex<Option<Duration>>,
    live: Mutex<HashSet<String>>,
    commands: Mutex<Vec<Vec<String>>>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            root: tempfile::tempdir().expect("create fake backend root"),
            // Source files "run" through the host shell.
            interpreter: "/bin/sh".to_string(),
            install_failure: Mutex::new(None),
            create_failure: Mutex::new(None),
            create_delay: Mutex::new(None),
            live: Mutex::new(HashSet::new()),
            commands: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        })
    }

    /// Make the next library install exit 1 with `message` on stderr.
    pub fn fail_install(&self, message: &str) {
        *self.install_failure.lock().unwrap() = Some(message.to_string());
    }

    /// Make `create` fail with an image error.
    pub fn fail_create(&self, message: &str) {
        *self.create_failure.lock().unwrap() = Some(message.to_string());
    }

    /// Make `create` take `delay` before it answers.
    pub fn delay_create(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Every argv passed to `exec`, in order.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().unwrap().clone()
    }

    /// Host directory backing the remote path `remote`.
    pub fn host_path(&self, remote: &str) -> PathBuf {
        self.root.path().join(remote.trim_start_matches('/'))
    }

    /// Wait until `destroy` has run `count` times, up to two seconds.
    pub async fn wait_destroyed(&self, count: usize) -> bool {
        for _ in 0..40 {
            if self.destroyed() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn rewrite(&self, value: &str) -> String {
        value.replace(WORKDIR, &self.host_path(WORKDIR).display().to_string())
    }

    fn ensure_live(&self, handle: &BackendHandle) -> BackendResult<()> {
        if self.live.lock().unwrap().contains(handle.id()) {
            Ok(())
        } else {
            Err(BackendError::NotFound(handle.id().to_string()))
        }
    }

    /// Canned answers for provisioning steps.
    ///
    /// Scripts are matched on their body (`sh -c <body> ...`), never on their
    /// arguments: the interpreter probe receives the venv bin dir as `$1`.
    fn canned(&self, command: &ExecCommand) -> Option<ExecutionResult> {
        let reply = |exit_code: i32, stdout: String, stderr: String| ExecutionResult {
            exit_code,
            stdout,
            stderr,
            elapsed: Duration::from_millis(1),
            timed_out: false,
        };

        if command.argv.get(1..3) == Some(&["-m".to_string(), "pip".to_string()][..]) {
            return Some(match self.install_failure.lock().unwrap().take() {
                Some(message) => reply(1, String::new(), message),
                None => reply(0, "Successfully installed\n".to_string(), String::new()),
            });
        }

        let script = match command.argv.as_slice() {
            [sh, flag, body, ..] if sh == "sh" && flag == "-c" => body.as_str(),
            _ => return None,
        };
        if script.contains(r#"command -v "$2""#) {
            return Some(reply(0, format!("{}\n", self.interpreter), String::new()));
        }
        if script.contains(".sandbox-venv") {
            return Some(reply(
                0,
                format!("{WORKDIR}/.sandbox-venv/bin\n"),
                String::new(),
            ));
        }
        None
    }
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    fn variant(&self) -> BackendVariant {
        BackendVariant::ContainerEngineLocal
    }

    async fn health_check(&self) -> BackendResult<String> {
        Ok("fake 1.0".to_string())
    }

    async fn create(&self, spec: &EnvironmentSpec) -> BackendResult<BackendHandle> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.create_failure.lock().unwrap().take() {
            return Err(BackendError::ImageNotFound(message));
        }
        std::fs::create_dir_all(self.host_path(&spec.workdir))?;
        let name = spec.environment_name();
        self.live.lock().unwrap().insert(name.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(BackendHandle::new(name, self.variant()))
    }

    async fn destroy(&self, handle: &BackendHandle) -> BackendResult<()> {
        self.live.lock().unwrap().remove(handle.id());
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exec(
        &self,
        handle: &BackendHandle,
        command: &ExecCommand,
    ) -> BackendResult<ExecutionResult> {
        self.ensure_live(handle)?;
        self.commands.lock().unwrap().push(command.argv.clone());
        if let Some(result) = self.canned(command) {
            return Ok(result);
        }

        let workdir = self.rewrite(command.workdir.as_deref().unwrap_or(WORKDIR));
        std::fs::create_dir_all(&workdir)?;

        let mut args = vec!["-c".to_string(), HOST_WRAPPER.to_string(), workdir];
        args.extend(
            command
                .env
                .iter()
                .map(|(k, v)| format!("{}={}", k, self.rewrite(v))),
        );
        args.extend(command.argv.iter().map(|a| self.rewrite(a)));

        let output = run_cli("sh", &args, command.stdin.clone(), command.timeout).await?;
        Ok(ExecutionResult {
            exit_code: output.status.unwrap_or(124),
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            elapsed: output.elapsed,
            timed_out: output.timed_out,
        })
    }

    async fn stage_in(
        &self,
        handle: &BackendHandle,
        local_path: &Path,
        remote_path: &str,
    ) -> BackendResult<()> {
        self.ensure_live(handle)?;
        let payload = sbx::archive::pack(local_path, "payload")?;
        land_archive(payload, "payload", &self.host_path(remote_path)).await
    }

    async fn stage_out(
        &self,
        handle: &BackendHandle,
        remote_path: &str,
        local_path: &Path,
    ) -> BackendResult<()> {
        self.ensure_live(handle)?;
        let payload = sbx::archive::pack(&self.host_path(remote_path), "payload")?;
        land_archive(payload, "payload", local_path).await
    }

    async fn path_exists(&self, handle: &BackendHandle, remote_path: &str) -> BackendResult<bool> {
        self.ensure_live(handle)?;
        Ok(self.host_path(remote_path).symlink_metadata().is_ok())
    }
}

/// Forwards the core driver calls to a [`FakeBackend`] and keeps the trait's
/// default transfer path: tar streamed through `exec` for stage-in, `tar -c`
/// for stage-out and `test -e` for existence checks.
#[derive(Debug)]
pub struct ExecStagingBackend {
    inner: Arc<FakeBackend>,
}

impl ExecStagingBackend {
    pub fn new(inner: Arc<FakeBackend>) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl SandboxBackend for ExecStagingBackend {
    fn variant(&self) -> BackendVariant {
        self.inner.variant()
    }

    async fn health_check(&self) -> BackendResult<String> {
        self.inner.health_check().await
    }

    async fn create(&self, spec: &EnvironmentSpec) -> BackendResult<BackendHandle> {
        self.inner.create(spec).await
    }

    async fn destroy(&self, handle: &BackendHandle) -> BackendResult<()> {
        self.inner.destroy(handle).await
    }

    async fn exec(
        &self,
        handle: &BackendHandle,
        command: &ExecCommand,
    ) -> BackendResult<ExecutionResult> {
        self.inner.exec(handle, command).await
    }
}

/// Python session config without libraries.
pub fn test_config() -> SessionConfig {
    SessionConfig::default().with_workdir(WORKDIR)
}

/// Write `files` (relative path, contents) below a fresh tempdir.
pub fn host_tree(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().expect("create host tree");
    for (path, contents) in files {
        let path = dir.path().join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent");
        }
        std::fs::write(path, contents).expect("write file");
    }
    dir
}
