//! Execution engine.
//!
//! Wraps every workload in a small shell launcher that records the workload's
//! pid inside the environment. When the caller's timeout expires the local
//! runtime client is killed and a second exec uses that pid to stop the remote
//! process, so a timed-out command does not keep running in the sandbox.

use std::collections::BTreeMap;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::backend::process::TIMEOUT_EXIT_CODE;
use crate::backend::{BackendHandle, BackendResult, ExecCommand, NAME_ALPHABET, SandboxBackend};
use crate::error::{SessionError, SessionResult};
use crate::install::RuntimeEnvironment;

/// Launcher: `$0` is the pidfile, `"$@"` the workload. The workload gets its
/// own process group when `setsid` exists, so cancellation reaches every
/// process it spawned.
const LAUNCHER: &str = r#"pidfile="$0"
[ -n "$SBX_PATH_PREFIX" ] && PATH="$SBX_PATH_PREFIX:$PATH" && export PATH
if command -v setsid >/dev/null 2>&1; then
  setsid "$@" &
else
  "$@" &
fi
pid=$!
echo "$pid" > "$pidfile"
wait "$pid"
rc=$?
rm -f "$pidfile"
exit "$rc""#;

/// Same as [`LAUNCHER`] with stderr folded into stdout.
const LAUNCHER_MERGED: &str = r#"pidfile="$0"
[ -n "$SBX_PATH_PREFIX" ] && PATH="$SBX_PATH_PREFIX:$PATH" && export PATH
if command -v setsid >/dev/null 2>&1; then
  setsid "$@" 2>&1 &
else
  "$@" 2>&1 &
fi
pid=$!
echo "$pid" > "$pidfile"
wait "$pid"
rc=$?
rm -f "$pidfile"
exit "$rc""#;

/// TERM the recorded workload's process group, its children and the workload
/// itself, then KILL whatever is left two seconds later. Each step may fail
/// (no group without `setsid`, no `pkill` in slim images) without stopping the
/// others.
const CANCEL_SCRIPT: &str = r#"pidfile="$1"
[ -f "$pidfile" ] || exit 0
pid=$(cat "$pidfile")
rm -f "$pidfile"
stop() {
  kill -"$1" "-$pid" 2>/dev/null
  pkill -"$1" -P "$pid" 2>/dev/null
  kill -"$1" "$pid" 2>/dev/null
}
stop TERM
( sleep 2; stop KILL ) >/dev/null 2>&1 &
exit 0"#;

/// Bound on the cancellation exec itself.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one execution. A non-zero `exit_code` is a normal result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    /// The command was stopped because it exceeded its timeout.
    pub timed_out: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Turn a timed-out result into [`SessionError::Timeout`].
    pub fn ensure_completed(self) -> SessionResult<Self> {
        if self.timed_out {
            return Err(SessionError::Timeout {
                operation: "execute",
                after: self.elapsed,
            });
        }
        Ok(self)
    }
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandLine {
    /// Interpreted by `sh -c`.
    Shell(String),
    /// Executed directly, no shell involved.
    Argv(Vec<String>),
}

impl CommandLine {
    fn into_argv(self) -> Vec<String> {
        match self {
            CommandLine::Shell(script) => vec!["sh".to_string(), "-c".to_string(), script],
            CommandLine::Argv(argv) => argv,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            CommandLine::Shell(script) => script.trim().is_empty(),
            CommandLine::Argv(argv) => argv.is_empty(),
        }
    }
}

/// A command plus its execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub command: CommandLine,
    pub timeout: Option<Duration>,
    /// Defaults to the session's working directory.
    pub workdir: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Fold stderr into stdout.
    pub merge_output: bool,
}

impl ExecutionRequest {
    pub fn shell(script: impl Into<String>) -> Self {
        Self::from_command(CommandLine::Shell(script.into()))
    }

    pub fn argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_command(CommandLine::Argv(argv.into_iter().map(Into::into).collect()))
    }

    fn from_command(command: CommandLine) -> Self {
        Self {
            command,
            timeout: None,
            workdir: None,
            env: BTreeMap::new(),
            merge_output: false,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_secs(self, secs: u64) -> Self {
        self.timeout(Duration::from_secs(secs))
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn merge_output(mut self, merge: bool) -> Self {
        self.merge_output = merge;
        self
    }
}

impl From<&str> for ExecutionRequest {
    fn from(script: &str) -> Self {
        ExecutionRequest::shell(script)
    }
}

impl From<String> for ExecutionRequest {
    fn from(script: String) -> Self {
        ExecutionRequest::shell(script)
    }
}

impl From<Vec<String>> for ExecutionRequest {
    fn from(argv: Vec<String>) -> Self {
        ExecutionRequest::argv(argv)
    }
}

/// Session-level defaults applied to each request.
#[derive(Debug, Clone)]
pub(crate) struct ExecDefaults<'a> {
    pub workdir: &'a str,
    pub timeout: Option<Duration>,
    pub env: &'a BTreeMap<String, String>,
    pub runtime: Option<&'a RuntimeEnvironment>,
}

/// Run `request` inside the environment behind `handle`.
///
/// Returns runtime-level failures as errors. A command that outlives its
/// timeout yields a result with `timed_out` set and exit code 124 after a
/// best-effort remote cancellation.
pub(crate) async fn execute(
    backend: &dyn SandboxBackend,
    handle: &BackendHandle,
    request: ExecutionRequest,
    defaults: &ExecDefaults<'_>,
) -> BackendResult<ExecutionResult> {
    if request.command.is_empty() {
        return Err(crate::backend::BackendError::InvalidInput(
            "empty command".to_string(),
        ));
    }

    let pidfile = format!("/tmp/.sbx-exec-{}.pid", nanoid::nanoid!(12, &NAME_ALPHABET));
    let launcher = if request.merge_output {
        LAUNCHER_MERGED
    } else {
        LAUNCHER
    };

    let mut argv = vec!["sh".to_string(), "-c".to_string(), launcher.to_string(), pidfile.clone()];
    argv.extend(request.command.into_argv());

    let timeout = request.timeout.or(defaults.timeout);
    let mut command = ExecCommand::new(argv)
        .workdir(request.workdir.unwrap_or_else(|| defaults.workdir.to_string()))
        .timeout(timeout);
    for (key, value) in defaults.env.iter().chain(request.env.iter()) {
        command = command.env(key.clone(), value.clone());
    }
    if let Some(runtime) = defaults.runtime {
        command.env.extend(runtime.exec_env());
    }

    let mut result = backend.exec(handle, &command).await?;

    if result.timed_out {
        debug!("{}: command timed out after {:?}, cancelling", handle, timeout);
        cancel(backend, handle, &pidfile).await;
        result.exit_code = TIMEOUT_EXIT_CODE;
    }

    Ok(result)
}

/// Stop the workload recorded in `pidfile`. Failures are only logged.
async fn cancel(backend: &dyn SandboxBackend, handle: &BackendHandle, pidfile: &str) {
    let command = ExecCommand::script(CANCEL_SCRIPT, &[pidfile]).timeout(Some(CANCEL_TIMEOUT));
    match backend.exec(handle, &command).await {
        Ok(result) if result.exit_code == 0 => {}
        Ok(result) => warn!(
            "{}: remote cancellation exited with {}: {}",
            handle,
            result.exit_code,
            result.stderr.trim()
        ),
        Err(e) => warn!("{}: remote cancellation failed: {}", handle, e),
    }
}
