//! Backend drivers.
//!
//! A driver owns the runtime-specific half of a session: creating and removing
//! the environment, running commands inside it and moving bytes across the
//! host/environment boundary. Everything above this module only sees the
//! [`SandboxBackend`] trait.

pub mod cluster;
pub mod engine;
mod error;
pub mod process;
pub mod validate;

pub use cluster::ClusterBackend;
pub use engine::{EngineBackend, RuntimeType};
pub use error::{BackendError, BackendResult};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::archive;
use crate::config::{ResourceLimits, SessionConfig};
use crate::error::{SessionError, SessionResult};
use crate::exec::ExecutionResult;
use crate::language::Language;
use process::{CliOutput, TIMEOUT_EXIT_CODE};
use validate::{split_parent, validate_container_path};

/// Top-level archive entry used when staging data into an environment.
const STAGE_ENTRY: &str = "payload";

/// Extract a tar stream from stdin into a sibling staging directory, then
/// swap it into place. `$1` is the staging directory, `$2` the destination.
/// The staging directory is always removed, so a failed extraction leaves the
/// destination untouched.
const STAGE_IN_SCRIPT: &str = r#"stage="$1"; dest="$2"
trap 'rm -rf "$stage"' EXIT
mkdir -p "$stage" && tar -x -f - -C "$stage" && rm -rf "$dest" && mv "$stage/payload" "$dest""#;

/// Which family of runtime backs a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendVariant {
    /// Docker or Podman daemon on the local host.
    #[default]
    #[serde(alias = "docker", alias = "podman", alias = "local")]
    ContainerEngineLocal,
    /// Kubernetes pod scheduled by a cluster.
    #[serde(alias = "kubernetes", alias = "k8s", alias = "cluster")]
    ClusterOrchestrated,
}

impl std::fmt::Display for BackendVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendVariant::ContainerEngineLocal => write!(f, "container-engine-local"),
            BackendVariant::ClusterOrchestrated => write!(f, "cluster-orchestrated"),
        }
    }
}

impl std::str::FromStr for BackendVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "container-engine-local" | "docker" | "podman" | "local" => {
                Ok(BackendVariant::ContainerEngineLocal)
            }
            "cluster-orchestrated" | "kubernetes" | "k8s" | "cluster" => {
                Ok(BackendVariant::ClusterOrchestrated)
            }
            _ => Err(format!("unknown backend variant: {}", s)),
        }
    }
}

/// What to provision.
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    /// Session that owns the environment; used for naming and labels.
    pub session_id: String,
    pub image: String,
    pub language: Language,
    /// Working directory inside the environment; created if missing.
    pub workdir: String,
    pub resource_limits: Option<ResourceLimits>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl EnvironmentSpec {
    /// Short, name-safe form of the session id.
    pub fn short_id(&self) -> String {
        self.session_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(12)
            .collect::<String>()
            .to_lowercase()
    }

    /// Container or pod name of the environment.
    pub fn environment_name(&self) -> String {
        format!("sbx-{}", self.short_id())
    }

    /// Labels applied to every environment, merged with user labels.
    pub fn all_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert("sbx.session".to_string(), self.short_id());
        labels.insert("sbx.language".to_string(), self.language.to_string());
        labels
    }
}

/// Opaque reference to a live environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHandle {
    id: String,
    variant: BackendVariant,
    namespace: Option<String>,
}

impl BackendHandle {
    pub fn new(id: impl Into<String>, variant: BackendVariant) -> Self {
        Self {
            id: id.into(),
            variant,
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Container id or pod name.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn variant(&self) -> BackendVariant {
        self.variant
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

impl std::fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// A command as the driver runs it: final argv plus execution context.
#[derive(Debug, Clone, Default)]
pub struct ExecCommand {
    pub argv: Vec<String>,
    pub workdir: Option<String>,
    pub env: Vec<(String, String)>,
    /// Bytes streamed to the command's stdin.
    pub stdin: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl ExecCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// `sh -c script name args...`
    pub fn script(script: &str, args: &[&str]) -> Self {
        let mut argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
        argv.push("sbx".to_string());
        argv.extend(args.iter().map(|a| a.to_string()));
        Self::new(argv)
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Driver contract implemented once per runtime variant.
///
/// `exec` reports a non-zero exit code of the command as a normal result; only
/// failures of the runtime itself are errors. `destroy` must tolerate handles
/// whose environment no longer exists.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn variant(&self) -> BackendVariant;

    /// Verify the runtime is reachable; returns a version description.
    async fn health_check(&self) -> BackendResult<String>;

    async fn create(&self, spec: &EnvironmentSpec) -> BackendResult<BackendHandle>;

    async fn destroy(&self, handle: &BackendHandle) -> BackendResult<()>;

    async fn exec(
        &self,
        handle: &BackendHandle,
        command: &ExecCommand,
    ) -> BackendResult<ExecutionResult>;

    /// Copy a host file or directory tree to `remote_path`, replacing it.
    async fn stage_in(
        &self,
        handle: &BackendHandle,
        local_path: &Path,
        remote_path: &str,
    ) -> BackendResult<()> {
        validate_container_path(remote_path)?;
        let (parent, _) = split_parent(remote_path).ok_or_else(|| {
            BackendError::InvalidInput(format!("cannot stage into '{}'", remote_path))
        })?;
        let staging = format!(
            "{}/.sbx-stage-{}",
            parent.trim_end_matches('/'),
            nanoid::nanoid!(10, &NAME_ALPHABET)
        );

        let payload =
            archive::pack_blocking(local_path.to_path_buf(), STAGE_ENTRY.to_string()).await?;
        debug!(
            "stage-in {} -> {}:{} ({} bytes)",
            local_path.display(),
            handle,
            remote_path,
            payload.len()
        );

        let command =
            ExecCommand::script(STAGE_IN_SCRIPT, &[&staging, remote_path]).stdin(payload);
        let result = self.exec(handle, &command).await?;
        if result.exit_code != 0 {
            return Err(BackendError::CommandFailed {
                command: "stage-in".to_string(),
                message: result.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Copy `remote_path` (file or tree) to `local_path`, replacing it.
    async fn stage_out(
        &self,
        handle: &BackendHandle,
        remote_path: &str,
        local_path: &Path,
    ) -> BackendResult<()> {
        validate_container_path(remote_path)?;
        let (parent, name) = split_parent(remote_path).ok_or_else(|| {
            BackendError::InvalidInput(format!("cannot stage out '{}'", remote_path))
        })?;

        let output = self
            .exec_raw(
                handle,
                &ExecCommand::new(["tar", "-c", "-f", "-", "-C", parent, name]),
            )
            .await?;
        if !output.success() {
            return Err(BackendError::command_failed("stage-out", &output.stderr));
        }
        debug!(
            "stage-out {}:{} -> {} ({} bytes)",
            handle,
            remote_path,
            local_path.display(),
            output.stdout.len()
        );

        land_archive(output.stdout, name, local_path).await
    }

    /// Whether `remote_path` exists inside the environment.
    async fn path_exists(&self, handle: &BackendHandle, remote_path: &str) -> BackendResult<bool> {
        validate_container_path(remote_path)?;
        let result = self
            .exec(handle, &ExecCommand::new(["test", "-e", remote_path]))
            .await?;
        Ok(result.exit_code == 0)
    }

    /// Run a command and keep stdout as raw bytes.
    ///
    /// The default goes through [`SandboxBackend::exec`], which decodes output
    /// as text; drivers override it so binary payloads survive.
    async fn exec_raw(
        &self,
        handle: &BackendHandle,
        command: &ExecCommand,
    ) -> BackendResult<CliOutput> {
        let result = self.exec(handle, command).await?;
        Ok(CliOutput {
            status: (!result.timed_out).then_some(result.exit_code),
            stdout: result.stdout.into_bytes(),
            stderr: result.stderr.into_bytes(),
            elapsed: result.elapsed,
            timed_out: result.timed_out,
        })
    }
}

/// Lowercase alphanumerics, valid in container names, pod names and paths.
pub(crate) const NAME_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Extract `archive` next to `local_path` and move its `entry_name` entry into
/// place.
///
/// Extraction happens in a hidden sibling directory, so `local_path` is only
/// replaced once the whole archive landed.
pub async fn land_archive(
    archive: Vec<u8>,
    entry_name: &str,
    local_path: &Path,
) -> BackendResult<()> {
    let parent = match local_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !archive::top_level_entries(&archive)?
        .iter()
        .any(|name| name == entry_name)
    {
        return Err(BackendError::ParseError(format!(
            "archive did not contain '{}'",
            entry_name
        )));
    }
    tokio::fs::create_dir_all(&parent).await?;

    let staging = tempfile::Builder::new()
        .prefix(".sbx-stage-")
        .tempdir_in(&parent)?;
    archive::unpack_blocking(archive, staging.path().to_path_buf()).await?;

    let extracted = staging.path().join(entry_name);

    match tokio::fs::symlink_metadata(local_path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(local_path).await?,
        Ok(_) => tokio::fs::remove_file(local_path).await?,
        Err(_) => {}
    }
    tokio::fs::rename(&extracted, local_path).await?;
    Ok(())
}

impl ExecutionResult {
    /// Convert raw CLI output of an in-environment command.
    pub(crate) fn from_cli(output: CliOutput) -> Self {
        ExecutionResult {
            exit_code: output.status.unwrap_or(TIMEOUT_EXIT_CODE),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            elapsed: output.elapsed,
            timed_out: output.timed_out,
        }
    }
}

/// Build the driver selected by `config`.
pub fn connect(config: &SessionConfig) -> SessionResult<Arc<dyn SandboxBackend>> {
    match config.backend {
        BackendVariant::ContainerEngineLocal => {
            let backend = match (config.engine, config.engine_binary.as_deref()) {
                (Some(kind), Some(binary)) => EngineBackend::with_binary(kind, binary),
                (Some(kind), None) => EngineBackend::with_type(kind),
                (None, Some(_)) => {
                    return Err(SessionError::InvalidConfig(
                        "engine_binary requires engine to be set".to_string(),
                    ));
                }
                (None, None) => EngineBackend::detect().map_err(|source| {
                    SessionError::Provision {
                        variant: BackendVariant::ContainerEngineLocal,
                        source,
                    }
                })?,
            };
            Ok(Arc::new(backend))
        }
        BackendVariant::ClusterOrchestrated => {
            let backend = ClusterBackend::from_config(&config.cluster).map_err(|source| {
                SessionError::Provision {
                    variant: BackendVariant::ClusterOrchestrated,
                    source,
                }
            })?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_parse_and_display() {
        assert_eq!(
            "docker".parse::<BackendVariant>().unwrap(),
            BackendVariant::ContainerEngineLocal
        );
        assert_eq!(
            "kubernetes".parse::<BackendVariant>().unwrap(),
            BackendVariant::ClusterOrchestrated
        );
        assert!("lxc".parse::<BackendVariant>().is_err());
        assert_eq!(
            BackendVariant::ClusterOrchestrated.to_string(),
            "cluster-orchestrated"
        );
    }

    #[test]
    fn test_spec_short_id_is_name_safe() {
        let spec = EnvironmentSpec {
            session_id: "4F1C2D3E-4B5A-4C6D-8E7F-001122334455".to_string(),
            image: "python:3.11-slim".to_string(),
            language: Language::Python,
            workdir: "/sandbox".to_string(),
            resource_limits: None,
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
        };
        assert_eq!(spec.short_id(), "4f1c2d3e4b5a");
        assert_eq!(spec.environment_name(), "sbx-4f1c2d3e4b5a");
        assert_eq!(spec.all_labels()["sbx.language"], "python");
    }

    #[test]
    fn test_exec_command_script_positional_args() {
        let cmd = ExecCommand::script("echo \"$1\"", &["hello world"]);
        assert_eq!(cmd.argv, vec!["sh", "-c", "echo \"$1\"", "sbx", "hello world"]);
    }

    #[tokio::test]
    async fn test_land_archive_replaces_destination() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("out/nested")).unwrap();
        std::fs::write(src.path().join("out/nested/r.txt"), "result").unwrap();
        let bytes = archive::pack(&src.path().join("out"), "out").unwrap();

        let dest_root = tempfile::tempdir().unwrap();
        let dest = dest_root.path().join("deep/results");
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(dest.join("stale.txt"), "old").unwrap();

        land_archive(bytes, "out", &dest).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.join("nested/r.txt")).unwrap(),
            "result"
        );
        assert!(!dest.join("stale.txt").exists());
        let leftovers: Vec<_> = std::fs::read_dir(dest_root.path().join("deep"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".sbx-stage-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_land_archive_missing_entry_leaves_destination() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), "a").unwrap();
        let bytes = archive::pack(&src.path().join("a.txt"), "a.txt").unwrap();

        let dest_root = tempfile::tempdir().unwrap();
        let dest = dest_root.path().join("keep.txt");
        std::fs::write(&dest, "keep").unwrap();

        assert!(land_archive(bytes, "other.txt", &dest).await.is_err());
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "keep");
    }
}
