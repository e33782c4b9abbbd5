//! Runtime CLI invocation.
//!
//! Both drivers talk to their runtime through a command-line client
//! (`docker`/`podman`, `kubectl`). This module spawns those clients with an
//! optional stdin payload, captures stdout and stderr on separate pipes and
//! enforces a wall-clock bound on the whole invocation.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Exit code reported for an invocation cut short by its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long to keep reading output after a timed-out client was killed.
/// Processes it spawned may still hold the pipes open.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Raw output of a CLI invocation.
#[derive(Debug, Clone)]
pub struct CliOutput {
    /// Exit code, `None` when the invocation was killed on timeout.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
    pub timed_out: bool,
}

impl CliOutput {
    /// Whether the client exited with status zero.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

/// Run `program args...`, feeding `stdin` if given.
///
/// On timeout the client process is killed and whatever output was produced
/// so far is returned with `timed_out = true`. Spawn failures surface as
/// `io::Error` so callers can distinguish "runtime missing" from "command
/// failed".
pub async fn run_cli(
    program: &str,
    args: &[String],
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
) -> io::Result<CliOutput> {
    trace!("exec: {} {}", program, args.join(" "));

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = command.spawn()?;

    let writer = match (child.stdin.take(), stdin) {
        (Some(mut pipe), Some(data)) => Some(tokio::spawn(async move {
            let result = pipe.write_all(&data).await;
            drop(pipe);
            result
        })),
        _ => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("stderr was not captured"))?;
    let stdout_drain = Drain::spawn(stdout);
    let stderr_drain = Drain::spawn(stderr);

    let (status, timed_out) = match timeout {
        Some(limit) => {
            let waited = tokio::time::timeout(limit, child.wait()).await;
            match waited {
                Ok(status) => (Some(status?), false),
                Err(_) => {
                    child.start_kill()?;
                    let _ = child.wait().await;
                    (None, true)
                }
            }
        }
        None => (Some(child.wait().await?), false),
    };

    if let Some(writer) = writer {
        match writer.await.map_err(io::Error::other)? {
            Ok(()) => {}
            // The client may exit before consuming all input; its status says why.
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
            Err(err) => return Err(err),
        }
    }

    let grace = timed_out.then_some(DRAIN_GRACE);
    let stdout = stdout_drain.finish(grace).await?;
    let stderr = stderr_drain.finish(grace).await?;

    Ok(CliOutput {
        status: status.map(exit_code_of),
        stdout,
        stderr,
        elapsed: started.elapsed(),
        timed_out,
    })
}

/// Background reader collecting one output pipe.
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<io::Result<()>>,
}

impl Drain {
    fn spawn<R>(mut reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let task = tokio::spawn(async move {
            let mut chunk = [0u8; 8192];
            loop {
                let n = reader.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(());
                }
                sink.lock()
                    .map_err(|_| io::Error::other("output buffer poisoned"))?
                    .extend_from_slice(&chunk[..n]);
            }
        });
        Self { buf, task }
    }

    /// Wait for EOF, or at most `grace` before keeping what was read so far.
    async fn finish(self, grace: Option<Duration>) -> io::Result<Vec<u8>> {
        match grace {
            None => self.task.await.map_err(io::Error::other)??,
            Some(grace) => {
                let abort = self.task.abort_handle();
                match tokio::time::timeout(grace, self.task).await {
                    Ok(joined) => joined.map_err(io::Error::other)??,
                    Err(_) => abort.abort(),
                }
            }
        }
        let mut buf = self
            .buf
            .lock()
            .map_err(|_| io::Error::other("output buffer poisoned"))?;
        Ok(std::mem::take(&mut *buf))
    }
}

/// Map an exit status to a shell-style exit code (128 + signal when killed).
fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Check if a binary is available in PATH.
pub fn is_binary_available(name: &str) -> bool {
    std::process::Command::new("which")
        .arg(name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Quote a string for a POSIX shell.
pub fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}
