//! External tool invocation.
//!
//! Every probe, cut, encode and merge goes through a [`ToolRunner`]. The
//! production runner spawns the process, streams stdout records to the caller,
//! keeps a short stderr tail for diagnostics, and enforces an absolute
//! timeout. Cancellation and timeouts kill the child rather than waiting for it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use process_utils::tokio_command;
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::records::RecordReader;
use crate::{Error, Result};

const STDERR_TAIL_LINES: usize = 20;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One fully described external command.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Keep every stdout record in [`ToolOutput::stdout`].
    pub capture_stdout: bool,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_TIMEOUT,
            capture_stdout: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn capturing_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }

    /// Value following `flag` in the argument list.
    pub fn arg_after(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// The last argument, which is the output path for ffmpeg-style tools.
    pub fn last_arg(&self) -> Option<&str> {
        self.args.last().map(String::as_str)
    }

    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

impl std::fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Result of a finished invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// `None` when the process was killed or exited through a signal.
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    pub stdout: Vec<String>,
    pub stderr_tail: Vec<String>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    /// Short human readable failure description.
    pub fn failure_summary(&self) -> String {
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        match self.stderr_tail.last() {
            Some(line) => format!("exit code {}: {}", code, line),
            None => format!("exit code {}", code),
        }
    }
}

/// Callback receiving each stdout record as it arrives.
pub type RecordSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// Runs external tools.
///
/// Implementations must kill the child when `cancel` fires or the invocation
/// timeout expires, returning [`Error::Cancelled`] or [`Error::Timeout`]. A
/// non-zero exit is not an error at this level; callers inspect
/// [`ToolOutput::success`].
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
        on_record: Option<RecordSink<'_>>,
    ) -> Result<ToolOutput>;
}

/// Spawns real child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    fn spawn(&self, invocation: &ToolInvocation) -> Result<Child> {
        if process_utils::find_program(&invocation.program).is_none() {
            return Err(Error::config(format!(
                "external tool '{}' not found",
                invocation.program.display()
            )));
        }

        tokio_command(&invocation.program)
            .args(&invocation.args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::io_path("spawning", &invocation.program, e))
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancellationToken,
        mut on_record: Option<RecordSink<'_>>,
    ) -> Result<ToolOutput> {
        let started = Instant::now();
        debug!(command = %invocation, "Spawning external tool");

        let mut child = self.spawn(invocation)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Other("Failed to capture tool stdout".to_string()))?;
        let stderr = child.stderr.take();

        let stderr_task = tokio::spawn(collect_tail(stderr, STDERR_TAIL_LINES));

        // Child of the caller's token: cancelling the run kills the process too.
        let kill = cancel.child_token();
        let mut waiter = spawn_process_waiter(child, kill.clone());
        // The waiter owns the child, so dropping this future must still kill it.
        let _kill_on_drop = kill.clone().drop_guard();

        let deadline_at = tokio::time::Instant::now() + invocation.timeout;
        let deadline = tokio::time::sleep_until(deadline_at);
        tokio::pin!(deadline);

        let mut reader = RecordReader::new(stdout);
        let mut captured = Vec::new();
        let mut timed_out = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    kill.cancel();
                    break;
                }
                _ = &mut deadline => {
                    timed_out = true;
                    kill.cancel();
                    break;
                }
                record = reader.next_record() => match record {
                    Ok(Some(line)) => {
                        if let Some(sink) = on_record.as_mut() {
                            (*sink)(&line);
                        }
                        if invocation.capture_stdout {
                            captured.push(line);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(program = %invocation.program_name(), error = %e, "Error reading tool output");
                        break;
                    }
                },
            }
        }

        // stdout closed; the process may still be shutting down.
        let exit_code = if kill.is_cancelled() {
            waiter.await.ok().flatten()
        } else {
            match tokio::time::timeout_at(deadline_at, &mut waiter).await {
                Ok(code) => code.ok().flatten(),
                Err(_) => {
                    timed_out = true;
                    kill.cancel();
                    waiter.await.ok().flatten()
                }
            }
        };

        // A grandchild may still hold stderr open after a kill.
        let stderr_tail = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, stderr_task)
            .await
            .ok()
            .and_then(|joined| joined.ok())
            .unwrap_or_default();

        if cancel.is_cancelled() {
            debug!(program = %invocation.program_name(), "External tool cancelled");
            return Err(Error::Cancelled);
        }
        if timed_out {
            warn!(
                program = %invocation.program_name(),
                timeout_secs = invocation.timeout.as_secs(),
                "External tool timed out and was killed"
            );
            return Err(Error::Timeout(format!(
                "{} exceeded {:?}",
                invocation.program_name(),
                invocation.timeout
            )));
        }

        Ok(ToolOutput {
            exit_code,
            elapsed: started.elapsed(),
            stdout: captured,
            stderr_tail,
        })
    }
}

/// Wait for a process in the background.
///
/// The receiver yields `Some(code)` when the process exits on its own and
/// `None` when `kill` fired first (the process is killed before sending).
pub fn spawn_process_waiter(
    mut child: Child,
    kill: CancellationToken,
) -> oneshot::Receiver<Option<i32>> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let exit_code = tokio::select! {
            _ = kill.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill child process");
                }
                None
            }
            status = child.wait() => match status {
                Ok(exit_status) => {
                    let code = exit_status.code();
                    if let Some(c) = code.filter(|c| *c != 0) {
                        debug!(code = c, "Process exited with non-zero code");
                    }
                    code
                }
                Err(e) => {
                    error!(error = %e, "Error waiting for process");
                    Some(-1)
                }
            }
        };
        let _ = tx.send(exit_code);
    });

    rx
}

async fn collect_tail<R>(stream: Option<R>, limit: usize) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return Vec::new();
    };
    let mut reader = RecordReader::new(stream);
    let mut tail = VecDeque::with_capacity(limit);
    while let Ok(Some(line)) = reader.next_record().await {
        if tail.len() == limit {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect()
}

/// Check that a path exists before handing it to a tool.
pub fn require_input(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(Error::io_path(
            "opening input",
            path,
            std::io::Error::from(std::io::ErrorKind::NotFound),
        ))
    }
}
