//! Subprocess execution for agent shell commands

use parking_lot::Mutex;
use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_COMMAND_TIMEOUT_SECS;

/// Time between the polite and the forced termination signal
const KILL_GRACE: Duration = Duration::from_millis(500);
/// Output kept per stream; the rest is drained and dropped
const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;
/// How long to wait for pipes to drain once the process is gone
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Environment variable names containing any of these are never passed on
const SENSITIVE_ENV_MARKERS: &[&str] = &[
    "KEY",
    "TOKEN",
    "SECRET",
    "PASSWORD",
    "PASSWD",
    "CREDENTIAL",
];

/// Outcome of one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed before it exited
    pub exit_code: Option<i32>,
    /// Signal that ended the process when something other than us sent it
    pub signal: Option<i32>,
    pub timed_out: bool,
}

impl ShellResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs commands through the user's shell
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    shell: String,
    shell_flag: &'static str,
    timeout: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ProcessRunner {
    /// `shell` overrides the platform default
    pub fn new(shell: Option<String>) -> Self {
        let (default_shell, shell_flag) = default_shell();
        Self {
            shell: shell
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(default_shell),
            shell_flag,
            timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Run `command` in `cwd` until it exits, times out or `cancel` fires.
    ///
    /// Only a spawn failure is an error; everything after that is described
    /// by the [`ShellResult`].
    pub async fn run(
        &self,
        command: &str,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> std::io::Result<ShellResult> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg(self.shell_flag)
            .arg(command)
            .current_dir(cwd)
            .env_clear()
            .envs(filtered_env(std::env::vars_os()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::debug!(shell = %self.shell, cwd = %cwd.display(), "spawning command");
        let mut child = cmd.spawn()?;

        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::new();
        if let Some(pipe) = child.stdout.take() {
            readers.push(tokio::spawn(capture(pipe, stdout.clone())));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(tokio::spawn(capture(pipe, stderr.clone())));
        }

        let mut timed_out = false;
        let mut signal = None;
        let exit_code = tokio::select! {
            status = child.wait() => {
                let status = status?;
                signal = terminating_signal(&status);
                status.code()
            }
            _ = tokio::time::sleep(self.timeout) => {
                tracing::debug!(timeout = ?self.timeout, "command timed out");
                timed_out = true;
                terminate(&mut child).await;
                None
            }
            _ = cancel.cancelled() => {
                tracing::debug!("command cancelled");
                terminate(&mut child).await;
                None
            }
        };

        // A background child can hold a pipe open long after the shell is gone
        for mut reader in readers {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut reader).await.is_err() {
                tracing::debug!("output pipe still open after exit");
                reader.abort();
            }
        }

        let stdout = String::from_utf8_lossy(&stdout.lock()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr.lock()).into_owned();
        Ok(ShellResult {
            stdout,
            stderr,
            exit_code,
            signal,
            timed_out,
        })
    }
}

/// The platform shell and its "run this string" flag
pub fn default_shell() -> (String, &'static str) {
    if cfg!(windows) {
        let shell = std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string());
        (shell, "/C")
    } else {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string());
        (shell, "-c")
    }
}

pub fn is_sensitive_env(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SENSITIVE_ENV_MARKERS.iter().any(|marker| upper.contains(marker))
}

/// The environment with sensitive variables removed
pub fn filtered_env(
    vars: impl IntoIterator<Item = (OsString, OsString)>,
) -> Vec<(OsString, OsString)> {
    vars.into_iter()
        .filter(|(name, _)| !is_sensitive_env(&name.to_string_lossy()))
        .collect()
}

async fn capture(mut pipe: impl AsyncRead + Unpin, sink: Arc<Mutex<Vec<u8>>>) {
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut sink = sink.lock();
                let room = MAX_CAPTURE_BYTES.saturating_sub(sink.len());
                sink.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
}

#[cfg(unix)]
fn terminating_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn terminating_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// SIGTERM the process group, then SIGKILL it if it outlives the grace period.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            signal_group(pid, libc::SIGTERM);
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
                return;
            }
            signal_group(pid, libc::SIGKILL);
        }
    }
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "kill failed");
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    // The child leads its own process group, so a negative pid reaches every
    // process it started.
    let ret = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if ret != 0 {
        tracing::debug!(
            pid,
            signal,
            error = %std::io::Error::last_os_error(),
            "signalling process group failed"
        );
    }
}
