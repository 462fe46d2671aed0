//! External process boundary: probe commands and provisioning jobs.

use std::collections::BTreeMap;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{IoContext, Result};

/// Captured result of a probe command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl ProbeOutput {
    fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Run `command` through `sh -c`, killing it if it outlives `timeout`.
///
/// Never errors: spawn failures and timeouts come back as unsuccessful
/// output with the reason in `stderr`. Trailing newlines are stripped from
/// stdout.
pub async fn run_probe(
    command: &str,
    env: &BTreeMap<String, String>,
    timeout: Duration,
) -> ProbeOutput {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(c) => c,
        Err(e) => return ProbeOutput::failed(format!("failed to spawn: {e}")),
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => ProbeOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout)
                .trim_end_matches(['\n', '\r'])
                .to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        },
        Ok(Err(e)) => ProbeOutput::failed(format!("failed to wait: {e}")),
        Err(_) => {
            debug!(command, timeout_secs = timeout.as_secs_f64(), "probe timed out");
            ProbeOutput::failed(format!("timed out after {}s", timeout.as_secs_f64()))
        }
    }
}

/// Exit status recorded for a job that could not be started.
pub const SPAWN_FAILED: i32 = 127;

/// Exit code of a finished process; signal deaths map to `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// A running process whose stdout and stderr are appended, line by line and
/// byte for byte, to every one of its log files.
pub struct LoggedChild {
    pid: u32,
    child: Child,
    pumps: Vec<JoinHandle<()>>,
    logs: Arc<Mutex<Vec<tokio::fs::File>>>,
}

/// Spawn `program` with `env` layered over the inherited environment.
pub async fn spawn_logged(
    program: &Path,
    env: &BTreeMap<String, String>,
    log_files: &[PathBuf],
    working_dir: Option<&Path>,
) -> Result<LoggedChild> {
    let mut logs = Vec::with_capacity(log_files.len());
    for path in log_files {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_path("opening log file", path)?;
        logs.push(file);
    }
    let logs = Arc::new(Mutex::new(logs));

    let mut cmd = Command::new(program);
    cmd.envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().with_path("spawning", program)?;
    let pid = child.id().unwrap_or_default();

    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump(stdout, logs.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump(stderr, logs.clone())));
    }

    debug!(program = %program.display(), pid, "spawned job process");
    Ok(LoggedChild {
        pid,
        child,
        pumps,
        logs,
    })
}

async fn pump(stream: impl AsyncRead + Unpin, logs: Arc<Mutex<Vec<tokio::fs::File>>>) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let mut write_failed = false;
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let mut logs = logs.lock().await;
                for file in logs.iter_mut() {
                    if let Err(e) = file.write_all(&line).await {
                        if !write_failed {
                            warn!(error = %e, "failed writing job output to log");
                            write_failed = true;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed reading job output");
                // keep the pipe drained so the job never blocks on a full buffer
                if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    debug!(error = %e, "job output pipe closed");
                }
                break;
            }
        }
    }
}

impl LoggedChild {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait for exit and for every output line to reach the logs.
    pub async fn wait(mut self) -> i32 {
        let code = match self.child.wait().await {
            Ok(status) => exit_code(status),
            Err(e) => {
                warn!(pid = self.pid, error = %e, "failed to wait for job process");
                -1
            }
        };
        for pump in self.pumps {
            if let Err(e) = pump.await {
                warn!(pid = self.pid, error = %e, "job output task failed");
            }
        }
        for file in self.logs.lock().await.iter_mut() {
            if let Err(e) = file.flush().await {
                warn!(pid = self.pid, error = %e, "failed flushing job log");
            }
        }
        code
    }
}

/// Send SIGHUP to `pid`.
pub fn send_hangup(pid: u32) -> std::io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGHUP) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Start `stoke supervise <spec>` in its own process group with no terminal
/// attached, and return its pid without waiting for it.
pub fn launch_supervisor(spec_path: &Path) -> Result<u32> {
    let exe = std::env::current_exe().map_err(|e| crate::Error::io("locating own executable", e))?;
    let child = std::process::Command::new(&exe)
        .arg("supervise")
        .arg(spec_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .with_path("spawning supervisor", &exe)?;
    Ok(child.id())
}
