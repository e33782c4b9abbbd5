//! Container-engine driver.
//!
//! Manages sandbox containers through the Docker or Podman CLI. The runtime is
//! auto-detected or can be configured explicitly. Each session gets one
//! long-lived container kept alive by an idle process; commands run through
//! `exec`, and `cp` streams archives out of it.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::process::{CliOutput, is_binary_available, run_cli};
use super::validate::{
    split_parent, validate_container_path, validate_env_var_key, validate_handle_id,
    validate_image_name,
};
use super::{
    BackendError, BackendHandle, BackendResult, BackendVariant, EnvironmentSpec, ExecCommand,
    SandboxBackend, land_archive,
};
use crate::exec::ExecutionResult;

/// Bound on short management calls (inspect, rm, version).
const MANAGEMENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Image pulls may take a while on cold hosts.
const PULL_TIMEOUT: Duration = Duration::from_secs(900);

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Docker runtime (default for macOS/Windows dev)
    Docker,
    /// Podman runtime (default for Linux)
    #[default]
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Whether a failed CLI call means the runtime itself is in trouble rather
    /// than the command running inside the container.
    fn is_runtime_failure(&self, stderr: &str) -> bool {
        let markers: &[&str] = match self {
            RuntimeType::Docker => &[
                "Error response from daemon",
                "Cannot connect to the Docker daemon",
                "No such container",
            ],
            RuntimeType::Podman => &[
                "no container with name or ID",
                "no such container",
                "Cannot connect to Podman",
                "can only create exec sessions on running containers",
            ],
        };
        markers.iter().any(|m| stderr.contains(m))
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

impl std::str::FromStr for RuntimeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(RuntimeType::Docker),
            "podman" => Ok(RuntimeType::Podman),
            _ => Err(format!("unknown container runtime: {}", s)),
        }
    }
}

/// Docker/Podman driver.
///
/// Stateless apart from the binary path, so one instance can serve any number
/// of concurrent sessions.
#[derive(Debug, Clone)]
pub struct EngineBackend {
    runtime_type: RuntimeType,
    binary: String,
}

impl EngineBackend {
    /// Detect an installed runtime.
    ///
    /// Prefers Docker on macOS and Podman elsewhere, falling back to whichever
    /// is on PATH.
    pub fn detect() -> BackendResult<Self> {
        #[cfg(target_os = "macos")]
        {
            if is_binary_available("docker") {
                return Ok(Self::with_type(RuntimeType::Docker));
            }
        }

        if is_binary_available("podman") {
            Ok(Self::with_type(RuntimeType::Podman))
        } else if is_binary_available("docker") {
            Ok(Self::with_type(RuntimeType::Docker))
        } else {
            Err(BackendError::NoRuntimeAvailable)
        }
    }

    /// Create a driver for a specific runtime type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a driver with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    async fn cli(
        &self,
        command: &str,
        args: Vec<String>,
        stdin: Option<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> BackendResult<CliOutput> {
        run_cli(&self.binary, &args, stdin, timeout)
            .await
            .map_err(|e| BackendError::Unreachable {
                binary: self.binary.clone(),
                message: format!("{}: {}", command, e),
            })
    }

    /// Check if an image exists locally.
    ///
    /// Uses `image inspect`, which works for both Docker and Podman.
    pub async fn image_exists(&self, image: &str) -> BackendResult<bool> {
        validate_image_name(image)?;

        let output = self
            .cli(
                "image inspect",
                vec!["image".into(), "inspect".into(), image.into()],
                None,
                Some(MANAGEMENT_TIMEOUT),
            )
            .await?;

        Ok(output.success())
    }

    /// Pull an image.
    pub async fn pull_image(&self, image: &str) -> BackendResult<()> {
        validate_image_name(image)?;

        let output = self
            .cli(
                "pull",
                vec!["pull".into(), image.into()],
                None,
                Some(PULL_TIMEOUT),
            )
            .await?;

        if output.timed_out {
            return Err(BackendError::Timeout {
                operation: format!("pull {}", image),
                seconds: PULL_TIMEOUT.as_secs(),
            });
        }
        if !output.success() {
            return Err(BackendError::ImageNotFound(format!(
                "{}: {}",
                image,
                output.stderr_lossy().trim()
            )));
        }

        Ok(())
    }

    /// Remove a container, ignoring containers that are already gone.
    pub async fn remove_container(&self, container_id: &str) -> BackendResult<()> {
        validate_handle_id(container_id)?;

        let output = self
            .cli(
                "rm",
                vec!["rm".into(), "-f".into(), container_id.into()],
                None,
                Some(MANAGEMENT_TIMEOUT),
            )
            .await?;

        if !output.success() {
            let stderr = output.stderr_lossy();
            if stderr.contains("No such container") || stderr.contains("no container with name")
            {
                debug!("container {} already removed", container_id);
                return Ok(());
            }
            return Err(BackendError::CommandFailed {
                command: "rm".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }

    /// Whether the container is running; `None` when it does not exist.
    async fn container_running(&self, container_id: &str) -> BackendResult<Option<bool>> {
        let output = self
            .cli(
                "inspect",
                vec![
                    "container".into(),
                    "inspect".into(),
                    "--format".into(),
                    "{{.State.Running}}".into(),
                    container_id.into(),
                ],
                None,
                Some(MANAGEMENT_TIMEOUT),
            )
            .await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(Some(output.stdout_lossy().trim() == "true"))
    }

    fn run_args(&self, spec: &EnvironmentSpec, name: &str) -> BackendResult<Vec<String>> {
        let mut owned_args: Vec<String> = vec!["run".to_string(), "-d".to_string()];

        owned_args.push("--name".to_string());
        owned_args.push(name.to_string());

        for (key, value) in spec.all_labels() {
            owned_args.push("--label".to_string());
            owned_args.push(format!("{}={}", key, value));
        }

        if let Some(ref limits) = spec.resource_limits {
            if let Some(cpus) = limits.cpus {
                owned_args.push("--cpus".to_string());
                owned_args.push(format!("{}", cpus));
            }
            if let Some(bytes) = limits
                .memory_bytes()
                .map_err(BackendError::InvalidInput)?
            {
                owned_args.push("--memory".to_string());
                owned_args.push(bytes.to_string());
            }
        }

        for (key, value) in &spec.env {
            owned_args.push("-e".to_string());
            owned_args.push(format!("{}={}", key, value));
        }

        // The engine creates the working directory if the image lacks it.
        owned_args.push("-w".to_string());
        owned_args.push(spec.workdir.clone());

        // Keep the container idle; workloads arrive through exec.
        owned_args.push("--entrypoint".to_string());
        owned_args.push("tail".to_string());
        owned_args.push(spec.image.clone());
        owned_args.push("-f".to_string());
        owned_args.push("/dev/null".to_string());

        Ok(owned_args)
    }

    fn exec_args(&self, handle: &BackendHandle, command: &ExecCommand) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if command.stdin.is_some() {
            args.push("-i".to_string());
        }
        if let Some(ref workdir) = command.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }
        for (key, value) in &command.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(handle.id().to_string());
        args.extend(command.argv.iter().cloned());
        args
    }
}

#[async_trait]
impl SandboxBackend for EngineBackend {
    fn variant(&self) -> BackendVariant {
        BackendVariant::ContainerEngineLocal
    }

    async fn health_check(&self) -> BackendResult<String> {
        let output = self
            .cli(
                "version",
                vec!["version".into(), "--format".into(), "json".into()],
                None,
                Some(MANAGEMENT_TIMEOUT),
            )
            .await?;

        if !output.success() {
            return Err(BackendError::Unreachable {
                binary: self.binary.clone(),
                message: output.stderr_lossy().trim().to_string(),
            });
        }

        Ok(output.stdout_lossy())
    }

    async fn create(&self, spec: &EnvironmentSpec) -> BackendResult<BackendHandle> {
        validate_image_name(&spec.image)?;
        validate_container_path(&spec.workdir)?;
        for key in spec.env.keys() {
            validate_env_var_key(key)?;
        }

        self.health_check().await?;

        if !self.image_exists(&spec.image).await? {
            info!("pulling image {} with {}", spec.image, self.runtime_type);
            self.pull_image(&spec.image).await?;
        }

        let name = spec.environment_name();
        let args = self.run_args(spec, &name)?;
        let output = self
            .cli("run", args, None, Some(MANAGEMENT_TIMEOUT))
            .await?;

        if !output.success() {
            // `run` can fail after the container was created (e.g. start
            // rejected the resource limits); do not leave it behind.
            if let Err(e) = self.remove_container(&name).await {
                warn!("cleanup of partially created container {} failed: {}", name, e);
            }
            return Err(BackendError::command_failed("run", &output.stderr));
        }

        let container_id = output.stdout_lossy().trim().to_string();
        if container_id.is_empty() {
            return Err(BackendError::ParseError(
                "run did not print a container id".to_string(),
            ));
        }
        info!(
            "created container {} ({}) from {}",
            name,
            &container_id[..container_id.len().min(12)],
            spec.image
        );

        Ok(BackendHandle::new(container_id, self.variant()))
    }

    async fn destroy(&self, handle: &BackendHandle) -> BackendResult<()> {
        self.remove_container(handle.id()).await
    }

    async fn exec(
        &self,
        handle: &BackendHandle,
        command: &ExecCommand,
    ) -> BackendResult<ExecutionResult> {
        let output = self.exec_raw(handle, command).await?;
        Ok(ExecutionResult::from_cli(output))
    }

    async fn exec_raw(
        &self,
        handle: &BackendHandle,
        command: &ExecCommand,
    ) -> BackendResult<CliOutput> {
        validate_handle_id(handle.id())?;
        if command.argv.is_empty() {
            return Err(BackendError::InvalidInput("empty command".to_string()));
        }

        let args = self.exec_args(handle, command);
        let output = self
            .cli("exec", args, command.stdin.clone(), command.timeout)
            .await?;

        if !output.success() && !output.timed_out {
            let stderr = output.stderr_lossy();
            // The workload's own stderr may carry the same markers, so only a
            // container that is no longer running makes this a runtime failure.
            if self.runtime_type.is_runtime_failure(&stderr) {
                match self.container_running(handle.id()).await? {
                    Some(true) => return Ok(output),
                    None => return Err(BackendError::NotFound(handle.id().to_string())),
                    Some(false) => {
                        return Err(BackendError::CommandFailed {
                            command: "exec".to_string(),
                            message: stderr.trim().to_string(),
                        });
                    }
                }
            }
        }

        Ok(output)
    }

    /// `cp <container>:<path> -` emits a tar stream without needing `tar`
    /// inside the image.
    async fn stage_out(
        &self,
        handle: &BackendHandle,
        remote_path: &str,
        local_path: &Path,
    ) -> BackendResult<()> {
        validate_handle_id(handle.id())?;
        validate_container_path(remote_path)?;
        let (_, name) = split_parent(remote_path).ok_or_else(|| {
            BackendError::InvalidInput(format!("cannot stage out '{}'", remote_path))
        })?;

        let output = self
            .cli(
                "cp",
                vec![
                    "cp".into(),
                    format!("{}:{}", handle.id(), remote_path),
                    "-".into(),
                ],
                None,
                None,
            )
            .await?;

        if !output.success() {
            let stderr = output.stderr_lossy();
            if stderr.contains("No such container") || stderr.contains("no container with") {
                return Err(BackendError::NotFound(handle.id().to_string()));
            }
            return Err(BackendError::CommandFailed {
                command: "cp".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        land_archive(output.stdout, name, local_path).await
    }
}
