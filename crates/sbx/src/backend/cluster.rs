//! Cluster driver.
//!
//! Runs each session in a single Kubernetes pod driven through `kubectl`. The
//! pod manifest is rendered from typed structs, applied from stdin and waited
//! on until the pod reports `Ready`. Commands and archive streams go through
//! `kubectl exec -i`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Serialize;

use super::process::{CliOutput, run_cli};
use super::validate::{
    validate_container_path, validate_env_var_key, validate_handle_id, validate_image_name,
    validate_namespace,
};
use super::{
    BackendError, BackendHandle, BackendResult, BackendVariant, EnvironmentSpec, ExecCommand,
    SandboxBackend,
};
use crate::config::ClusterConfig;
use crate::exec::ExecutionResult;

/// Name of the single container inside each sandbox pod.
const CONTAINER_NAME: &str = "sandbox";

const MANAGEMENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Waiting reasons that mean the image will never start.
const IMAGE_FAILURES: &[&str] = &["ErrImagePull", "ImagePullBackOff", "InvalidImageName"];

/// Pod manifest, limited to the fields a sandbox pod needs.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PodManifest {
    api_version: &'static str,
    kind: &'static str,
    metadata: ObjectMeta,
    spec: PodSpec,
}

#[derive(Debug, Serialize)]
struct ObjectMeta {
    name: String,
    namespace: String,
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    restart_policy: &'static str,
    termination_grace_period_seconds: u32,
    automount_service_account_token: bool,
    containers: Vec<ContainerSpec>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContainerSpec {
    name: &'static str,
    image: String,
    command: Vec<String>,
    working_dir: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    env: Vec<EnvVar>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resources: Option<Resources>,
}

#[derive(Debug, Serialize)]
struct EnvVar {
    name: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct Resources {
    limits: BTreeMap<String, String>,
    requests: BTreeMap<String, String>,
}

/// `kubectl` driver.
#[derive(Debug, Clone)]
pub struct ClusterBackend {
    kubectl: String,
    namespace: String,
    context: Option<String>,
    ready_timeout: Duration,
}

impl ClusterBackend {
    pub fn from_config(config: &ClusterConfig) -> BackendResult<Self> {
        validate_namespace(&config.namespace)?;
        if config.kubectl.trim().is_empty() {
            return Err(BackendError::InvalidInput(
                "kubectl binary cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            kubectl: config.kubectl.clone(),
            namespace: config.namespace.clone(),
            context: config.context.clone(),
            ready_timeout: Duration::from_secs(config.ready_timeout_secs),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Global flags shared by every invocation.
    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref context) = self.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        args.push("-n".to_string());
        args.push(self.namespace.clone());
        args
    }

    async fn kubectl(
        &self,
        operation: &str,
        extra: Vec<String>,
        stdin: Option<Vec<u8>>,
        timeout: Option<Duration>,
    ) -> BackendResult<CliOutput> {
        let mut args = self.base_args();
        args.extend(extra);
        run_cli(&self.kubectl, &args, stdin, timeout)
            .await
            .map_err(|e| BackendError::Unreachable {
                binary: self.kubectl.clone(),
                message: format!("{}: {}", operation, e),
            })
    }

    fn manifest(&self, spec: &EnvironmentSpec, name: &str) -> BackendResult<PodManifest> {
        let env = spec
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: value.clone(),
            })
            .collect();

        let resources = match spec.resource_limits {
            Some(ref limits) => {
                let mut map = BTreeMap::new();
                if let Some(cpus) = limits.cpus {
                    map.insert("cpu".to_string(), format!("{}m", (cpus * 1000.0).ceil() as u64));
                }
                if let Some(bytes) = limits
                    .memory_bytes()
                    .map_err(BackendError::InvalidInput)?
                {
                    map.insert("memory".to_string(), bytes.to_string());
                }
                (!map.is_empty()).then(|| Resources {
                    requests: map.clone(),
                    limits: map,
                })
            }
            None => None,
        };

        Ok(PodManifest {
            api_version: "v1",
            kind: "Pod",
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: self.namespace.clone(),
                labels: spec.all_labels(),
            },
            spec: PodSpec {
                restart_policy: "Never",
                termination_grace_period_seconds: 1,
                automount_service_account_token: false,
                containers: vec![ContainerSpec {
                    name: CONTAINER_NAME,
                    image: spec.image.clone(),
                    command: vec![
                        "tail".to_string(),
                        "-f".to_string(),
                        "/dev/null".to_string(),
                    ],
                    working_dir: spec.workdir.clone(),
                    env,
                    resources,
                }],
            },
        })
    }

    /// Reason the sandbox container is stuck waiting, if any.
    async fn waiting_reason(&self, pod: &str) -> Option<String> {
        let output = self
            .kubectl(
                "get pod",
                vec![
                    "get".into(),
                    "pod".into(),
                    pod.into(),
                    "-o".into(),
                    "jsonpath={.status.containerStatuses[0].state.waiting.reason}".into(),
                ],
                None,
                Some(MANAGEMENT_TIMEOUT),
            )
            .await
            .ok()?;
        let reason = output.stdout_lossy().trim().to_string();
        (output.success() && !reason.is_empty()).then_some(reason)
    }

    async fn delete_pod(&self, pod: &str) -> BackendResult<()> {
        let output = self
            .kubectl(
                "delete pod",
                vec![
                    "delete".into(),
                    "pod".into(),
                    pod.into(),
                    "--ignore-not-found".into(),
                    "--wait=false".into(),
                ],
                None,
                Some(MANAGEMENT_TIMEOUT),
            )
            .await?;
        if !output.success() {
            return Err(BackendError::command_failed("delete pod", &output.stderr));
        }
        Ok(())
    }

    fn exec_args(&self, handle: &BackendHandle, command: &ExecCommand) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if command.stdin.is_some() {
            args.push("-i".to_string());
        }
        args.push(handle.id().to_string());
        args.push("-c".to_string());
        args.push(CONTAINER_NAME.to_string());
        args.push("--".to_string());

        // kubectl exec has no workdir or env flags.
        if !command.env.is_empty() {
            args.push("env".to_string());
            args.extend(command.env.iter().map(|(k, v)| format!("{}={}", k, v)));
        }
        if let Some(ref workdir) = command.workdir {
            args.push("sh".to_string());
            args.push("-c".to_string());
            args.push(r#"cd "$0" && exec "$@""#.to_string());
            args.push(workdir.clone());
        }
        args.extend(command.argv.iter().cloned());
        args
    }
}

/// kubectl reports a non-zero remote exit on stderr; the exit code already
/// carries it.
fn strip_exit_notice(mut stderr: Vec<u8>) -> Vec<u8> {
    const NOTICE: &[u8] = b"command terminated with exit code";

    let mut end = stderr.len();
    while end > 0 && stderr[end - 1] == b'\n' {
        end -= 1;
    }
    let start = stderr[..end]
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i + 1);
    if stderr[start..end].starts_with(NOTICE) {
        stderr.truncate(start);
    }
    stderr
}

fn is_cluster_failure(stderr: &str) -> bool {
    stderr.contains("Error from server")
        || stderr.contains("Unable to connect to the server")
        || stderr.contains("error: unable to upgrade connection")
}

#[async_trait]
impl SandboxBackend for ClusterBackend {
    fn variant(&self) -> BackendVariant {
        BackendVariant::ClusterOrchestrated
    }

    async fn health_check(&self) -> BackendResult<String> {
        let output = self
            .kubectl(
                "version",
                vec!["version".into(), "-o".into(), "json".into()],
                None,
                Some(MANAGEMENT_TIMEOUT),
            )
            .await?;
        if !output.success() {
            return Err(BackendError::Unreachable {
                binary: self.kubectl.clone(),
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

        let name = spec.environment_name();
        let manifest = serde_yaml::to_string(&self.manifest(spec, &name)?)
            .map_err(|e| BackendError::InvalidInput(format!("pod manifest: {}", e)))?;
        debug!("applying pod manifest:\n{}", manifest);

        let applied = self
            .kubectl(
                "apply",
                vec!["apply".into(), "-f".into(), "-".into()],
                Some(manifest.into_bytes()),
                Some(MANAGEMENT_TIMEOUT),
            )
            .await?;
        if !applied.success() {
            // The API server may have persisted the pod before the call failed.
            if let Err(e) = self.delete_pod(&name).await {
                warn!("cleanup of pod {} after failed apply failed: {}", name, e);
            }
            if applied.timed_out {
                return Err(BackendError::Timeout {
                    operation: format!("applying pod {}", name),
                    seconds: MANAGEMENT_TIMEOUT.as_secs(),
                });
            }
            return Err(BackendError::command_failed("apply", &applied.stderr));
        }

        let wait_secs = self.ready_timeout.as_secs().max(1);
        let waited = self
            .kubectl(
                "wait",
                vec![
                    "wait".into(),
                    "--for=condition=Ready".into(),
                    format!("pod/{}", name),
                    format!("--timeout={}s", wait_secs),
                ],
                None,
                Some(self.ready_timeout + MANAGEMENT_TIMEOUT),
            )
            .await;

        let ready = matches!(&waited, Ok(output) if output.success());
        if !ready {
            let reason = self.waiting_reason(&name).await;
            if let Err(e) = self.delete_pod(&name).await {
                warn!("cleanup of pod {} failed: {}", name, e);
            }

            let waited = waited?;
            if let Some(reason) = reason {
                if IMAGE_FAILURES.contains(&reason.as_str()) {
                    return Err(BackendError::ImageNotFound(format!(
                        "{} ({})",
                        spec.image, reason
                    )));
                }
            }
            let stderr = waited.stderr_lossy();
            if waited.timed_out || stderr.contains("timed out") {
                return Err(BackendError::Timeout {
                    operation: format!("waiting for pod {}", name),
                    seconds: wait_secs,
                });
            }
            return Err(BackendError::CommandFailed {
                command: "wait".to_string(),
                message: stderr.trim().to_string(),
            });
        }

        info!("pod {}/{} ready ({})", self.namespace, name, spec.image);
        Ok(BackendHandle::new(name, self.variant()).with_namespace(self.namespace.clone()))
    }

    async fn destroy(&self, handle: &BackendHandle) -> BackendResult<()> {
        validate_handle_id(handle.id())?;
        self.delete_pod(handle.id()).await
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
        for (key, _) in &command.env {
            validate_env_var_key(key)?;
        }

        let args = self.exec_args(handle, command);
        let mut output = self
            .kubectl("exec", args, command.stdin.clone(), command.timeout)
            .await?;

        if !output.success() && !output.timed_out {
            let stderr = output.stderr_lossy();
            if stderr.contains(&format!("pods \"{}\" not found", handle.id())) {
                return Err(BackendError::NotFound(handle.to_string()));
            }
            if is_cluster_failure(&stderr) {
                return Err(BackendError::CommandFailed {
                    command: "exec".to_string(),
                    message: stderr.trim().to_string(),
                });
            }
            output.stderr = strip_exit_notice(output.stderr);
        }

        Ok(output)
    }
}
