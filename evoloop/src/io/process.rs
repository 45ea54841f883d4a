//! Subprocess handles with a line-oriented event stream, bounded output, a
//! hard deadline, and cooperative cancellation.
//!
//! `cancel` sends SIGTERM to the child's process group, waits out the grace
//! window, then force-kills the group. Cancelling a process that already
//! exited is a no-op, and repeating a cancel is always safe.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader,
};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
}

impl ProcessSpec {
    /// Build from a configured `[program, args...]` command.
    pub fn from_command(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("empty command"))?;
        Ok(Self {
            program: program.into(),
            args: args.iter().map(OsString::from).collect(),
            ..Self::default()
        })
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Terminal state of a process.
#[derive(Debug)]
pub struct ProcessExit {
    /// `None` only if the process could not be reaped.
    pub status: Option<ExitStatus>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub stderr: String,
    pub stderr_truncated: usize,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.status.is_some_and(|s| s.success())
    }

    pub fn describe(&self) -> String {
        if self.timed_out {
            return "timed out".to_string();
        }
        if self.cancelled {
            return "cancelled".to_string();
        }
        match self.status.and_then(|s| s.code()) {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

/// A running subprocess.
pub struct ProcessHandle {
    child: Child,
    lines: mpsc::UnboundedReceiver<String>,
    stderr_task: Option<JoinHandle<(Vec<u8>, usize)>>,
    deadline: Instant,
    status: Option<ExitStatus>,
    cancelled: bool,
    timed_out: bool,
}

impl ProcessHandle {
    /// Spawn `spec`. Lines longer than `output_limit_bytes` are cut.
    #[instrument(skip_all, fields(program = ?spec.program, timeout_secs = timeout.as_secs()))]
    pub fn start(spec: ProcessSpec, timeout: Duration, output_limit_bytes: usize) -> Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        debug!("spawning child process");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(err = %e, "failed to spawn command");
                return Err(e).with_context(|| format!("spawn {:?}", spec.program));
            }
        };

        if let Some(input) = spec.stdin {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(err = %e, "child closed stdin early");
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let (tx, lines) = mpsc::unbounded_channel();
        tokio::spawn(forward_lines(stdout, tx, output_limit_bytes));
        let stderr_task = tokio::spawn(read_stream_limited(stderr, output_limit_bytes));

        Ok(Self {
            child,
            lines,
            stderr_task: Some(stderr_task),
            deadline: Instant::now() + timeout,
            status: None,
            cancelled: false,
            timed_out: false,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Next stdout line; `None` once stdout is closed.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Cooperative terminate, escalating to a forced kill after `grace`.
    pub async fn cancel(&mut self, grace: Duration) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        if let Some(status) = self.child.try_wait().context("poll child")? {
            self.status = Some(status);
            return Ok(());
        }
        self.cancelled = true;
        self.terminate(grace).await
    }

    async fn terminate(&mut self, grace: Duration) -> Result<()> {
        let pid = self.child.id();
        signal_group(pid, false);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                self.status = Some(status.context("wait after SIGTERM")?);
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "process ignored SIGTERM, killing");
                signal_group(pid, true);
                if let Err(e) = self.child.start_kill() {
                    debug!(err = %e, "kill after grace failed");
                }
                self.status = Some(self.child.wait().await.context("wait after kill")?);
            }
        }
        Ok(())
    }

    /// Wait for exit, enforcing the deadline. Returns the collected stderr.
    pub async fn wait(&mut self, grace: Duration) -> Result<ProcessExit> {
        if self.status.is_none() {
            tokio::select! {
                status = self.child.wait() => {
                    self.status = Some(status.context("wait for child")?);
                }
                _ = tokio::time::sleep_until(self.deadline) => {
                    warn!("process deadline reached, terminating");
                    self.timed_out = true;
                    self.terminate(grace).await?;
                }
            }
        }
        // A detached grandchild can hold stderr open past the child's exit.
        let (stderr, stderr_truncated) = match self.stderr_task.take() {
            Some(task) => match tokio::time::timeout(grace, task).await {
                Ok(joined) => joined.map_err(|e| anyhow!("stderr reader failed: {e}"))?,
                Err(_) => (b"[stderr still open after exit]".to_vec(), 0),
            },
            None => (Vec::new(), 0),
        };
        if stderr_truncated > 0 {
            warn!(stderr_truncated, "stderr truncated");
        }
        debug!(exit_code = ?self.status.and_then(|s| s.code()), timed_out = self.timed_out, "process finished");
        Ok(ProcessExit {
            status: self.status,
            timed_out: self.timed_out,
            cancelled: self.cancelled,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            stderr_truncated,
        })
    }

    /// Run to completion and collect stdout, for one-shot commands.
    pub async fn collect(mut self, grace: Duration) -> Result<(Vec<String>, ProcessExit)> {
        let mut stdout = Vec::new();
        let deadline = self.deadline;
        loop {
            tokio::select! {
                line = self.lines.recv() => match line {
                    Some(line) => stdout.push(line),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        let exit = self.wait(grace).await?;
        Ok((stdout, exit))
    }
}

/// Signal the child's process group: SIGTERM, or SIGKILL when `force`.
#[cfg(unix)]
fn signal_group(pid: Option<u32>, force: bool) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        debug!(err = %e, pid = raw, ?signal, "signalling process group failed");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _force: bool) {}

/// Read one line, keeping at most `limit` bytes of it and discarding the rest
/// up to and including the newline. Returns the bytes consumed (0 at EOF).
async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<usize> {
    let mut consumed = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(consumed);
        }
        let (len, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };
        let room = limit.saturating_sub(buf.len());
        buf.extend_from_slice(&available[..len.min(room)]);
        reader.consume(len);
        consumed += len;
        if complete {
            return Ok(consumed);
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(
    reader: R,
    tx: mpsc::UnboundedSender<String>,
    line_limit: usize,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match read_line_bounded(&mut reader, &mut buf, line_limit).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(err = %e, "stdout read failed");
                break;
            }
        }
    }
}

async fn read_stream_limited<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> (Vec<u8>, usize) {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    (buf, truncated)
}

/// Resolve a program the way `Command` would: paths are checked directly,
/// bare names are searched on `PATH`.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|full| full.is_file())
}
