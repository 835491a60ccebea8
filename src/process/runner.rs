//! External process runner.
//!
//! [`ProcessRunner`] launches one external command as an argument vector
//! (never through a shell), streams both output pipes line by line while the
//! process runs, and enforces a deadline. When the deadline passes, or the
//! caller cancels, the whole process tree is terminated before an error is
//! returned, so a run never leaves orphans behind.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::kill::{isolate_process_group, terminate_tree, wait_and_sweep};
use crate::error::{Error, Result};
use crate::{slog_debug, slog_trace, slog_warn};

/// Default runner timeout (5 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Pause between the graceful and the forceful termination signal.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for the output readers once the process is gone.
///
/// A helper that escaped the process group can hold a pipe open forever;
/// whatever was read before the limit is kept.
const READER_DRAIN: Duration = Duration::from_millis(500);

/// Characters a shell would interpret. Rejected in every argument.
const DANGEROUS_CHARS: [char; 7] = [';', '|', '&', '$', '`', '\n', '\r'];

/// Callback invoked for every stdout line as it arrives.
pub type OutputCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Lines read so far, shared with the reader task so an abandoned read
/// still leaves its output behind.
type SharedLines = Arc<Mutex<Vec<String>>>;

/// Outcome of one external process run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResult {
    /// The full argument vector, program first.
    pub command: Vec<String>,
    /// Exit code, or -1 when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall-clock time from spawn to exit.
    pub execution_time: Duration,
    pub timed_out: bool,
}

impl ProcessResult {
    /// A result with no output, used as the base for failure reports.
    pub fn empty(command: Vec<String>) -> Self {
        Self {
            command,
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            execution_time: Duration::ZERO,
            timed_out: false,
        }
    }

    /// Exit code zero and not timed out.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

impl fmt::Display for ProcessResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (exit: {}, {:.2}s{})",
            self.command.join(" "),
            self.exit_code,
            self.execution_time.as_secs_f64(),
            if self.timed_out { ", timed out" } else { "" }
        )
    }
}

/// Reject commands that are empty or carry shell metacharacters.
///
/// Commands are always executed as an argument vector, so these characters
/// would never reach a shell; rejecting them anyway keeps injected values
/// from flowing into tools that hand arguments to one themselves.
pub fn validate_command<S: AsRef<str>>(command: &[S]) -> Result<()> {
    let Some(program) = command.first() else {
        return Err(Error::CommandValidation("command is empty".to_string()));
    };
    if program.as_ref().trim().is_empty() {
        return Err(Error::CommandValidation("program name is empty".to_string()));
    }

    for arg in command {
        let arg = arg.as_ref();
        if let Some(c) = arg.chars().find(|c| DANGEROUS_CHARS.contains(c)) {
            return Err(Error::CommandValidation(format!(
                "argument contains dangerous character {:?}: {:?}",
                c, arg
            )));
        }
    }
    Ok(())
}

/// How the wait for the process ended.
enum Exit {
    Finished(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs external commands for one tool.
///
/// # Example
///
/// ```ignore
/// use scanflow::process::ProcessRunner;
/// use std::time::Duration;
///
/// let runner = ProcessRunner::new("echo").with_timeout(Duration::from_secs(10));
/// let result = runner.run(&["echo", "hello world"], None, None).await?;
/// assert!(result.stdout.contains("hello world"));
/// ```
#[derive(Clone)]
pub struct ProcessRunner {
    tool_name: String,
    timeout: Duration,
    kill_grace: Duration,
    output_callback: Option<OutputCallback>,
}

impl ProcessRunner {
    pub fn new(tool_name: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            kill_grace: DEFAULT_KILL_GRACE,
            output_callback: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Receive stdout lines as they arrive (live progress).
    pub fn with_output_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.output_callback = Some(Arc::new(callback));
        self
    }

    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn kill_grace(&self) -> Duration {
        self.kill_grace
    }

    /// Run a command to completion.
    ///
    /// `env` entries are added to (and override) the inherited environment.
    ///
    /// # Errors
    ///
    /// - [`Error::CommandValidation`] before anything is spawned
    /// - [`Error::Timeout`] after the process tree has been killed
    /// - [`Error::Execution`] for a non-zero exit or a spawn/read fault
    /// - [`Error::TaskJoin`] when the output callback panicked
    pub async fn run<S: AsRef<str>>(
        &self,
        command: &[S],
        cwd: Option<&Path>,
        env: Option<&HashMap<String, String>>,
    ) -> Result<ProcessResult> {
        self.run_with_cancel(command, cwd, env, &CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), but also stops when `cancel` fires.
    ///
    /// Cancellation kills the process tree exactly like a timeout and
    /// returns [`Error::Cancelled`].
    pub async fn run_with_cancel<S: AsRef<str>>(
        &self,
        command: &[S],
        cwd: Option<&Path>,
        env: Option<&HashMap<String, String>>,
        cancel: &CancellationToken,
    ) -> Result<ProcessResult> {
        validate_command(command)?;
        let command: Vec<String> = command.iter().map(|s| s.as_ref().to_string()).collect();

        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                tool: self.tool_name.clone(),
            });
        }

        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        if let Some(vars) = env {
            cmd.envs(vars);
        }
        isolate_process_group(&mut cmd);

        let start = Instant::now();
        slog_debug!(
            "ProcessRunner[{}]: spawning {:?} timeout={:?}",
            self.tool_name,
            command,
            self.timeout
        );
        let mut child = cmd.spawn().map_err(|e| self.fault(&command, e))?;
        let pid = child.id();

        let stdout_lines = SharedLines::default();
        let stderr_lines = SharedLines::default();
        let mut stdout_task = tokio::spawn(collect_lines(
            child.stdout.take(),
            self.output_callback.clone(),
            Arc::clone(&stdout_lines),
        ));
        let mut stderr_task = tokio::spawn(collect_lines(
            child.stderr.take(),
            None,
            Arc::clone(&stderr_lines),
        ));

        let exit = tokio::select! {
            status = wait_and_sweep(&mut child, pid) => Exit::Finished(status),
            _ = tokio::time::sleep(self.timeout) => Exit::TimedOut,
            _ = cancel.cancelled() => Exit::Cancelled,
        };

        let cancelled = matches!(exit, Exit::Cancelled);
        match exit {
            Exit::Finished(status) => {
                let status = status.map_err(|e| self.fault(&command, e))?;
                let stdout = drain(&mut stdout_task, &stdout_lines).await?;
                let stderr = drain(&mut stderr_task, &stderr_lines).await?;

                let result = ProcessResult {
                    command,
                    exit_code: status.code().unwrap_or(-1),
                    stdout: stdout.join("\n"),
                    stderr: stderr.join("\n"),
                    execution_time: start.elapsed(),
                    timed_out: false,
                };
                slog_debug!("ProcessRunner[{}]: finished {}", self.tool_name, result);

                if result.exit_code != 0 {
                    return Err(Error::Execution {
                        tool: self.tool_name.clone(),
                        command: result.command,
                        exit_code: result.exit_code,
                        stderr: result.stderr,
                    });
                }
                Ok(result)
            }
            Exit::TimedOut | Exit::Cancelled => {
                slog_warn!(
                    "ProcessRunner[{}]: {} after {:?}, terminating process tree",
                    self.tool_name,
                    if cancelled { "cancelled" } else { "timed out" },
                    start.elapsed()
                );
                match pid {
                    Some(pid) => terminate_tree(&mut child, pid, self.kill_grace).await,
                    None => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                    }
                }

                // Pipes close once every process in the tree is gone.
                let stdout = drain(&mut stdout_task, &stdout_lines)
                    .await
                    .unwrap_or_else(|_| snapshot(&stdout_lines));
                let stderr = drain(&mut stderr_task, &stderr_lines)
                    .await
                    .unwrap_or_else(|_| snapshot(&stderr_lines));

                if cancelled {
                    return Err(Error::Cancelled {
                        tool: self.tool_name.clone(),
                    });
                }

                let exit_code = child
                    .try_wait()
                    .ok()
                    .flatten()
                    .and_then(|status| status.code())
                    .unwrap_or(-1);
                Err(Error::Timeout {
                    tool: self.tool_name.clone(),
                    timeout: self.timeout,
                    partial: Box::new(ProcessResult {
                        command,
                        exit_code,
                        stdout: stdout.join("\n"),
                        stderr: stderr.join("\n"),
                        execution_time: start.elapsed(),
                        timed_out: true,
                    }),
                })
            }
        }
    }

    /// Blocking variant for callers without an async runtime.
    ///
    /// Builds a private current-thread runtime, so it must not be called
    /// from inside another tokio runtime.
    pub fn run_sync<S: AsRef<str>>(
        &self,
        command: &[S],
        cwd: Option<&Path>,
        env: Option<&HashMap<String, String>>,
    ) -> Result<ProcessResult> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run(command, cwd, env))
    }

    /// Normalize a spawn or I/O fault into an execution failure.
    fn fault(&self, command: &[String], e: std::io::Error) -> Error {
        slog_warn!("ProcessRunner[{}]: {}", self.tool_name, e);
        Error::Execution {
            tool: self.tool_name.clone(),
            command: command.to_vec(),
            exit_code: -1,
            stderr: e.to_string(),
        }
    }
}

impl fmt::Debug for ProcessRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRunner")
            .field("tool_name", &self.tool_name)
            .field("timeout", &self.timeout)
            .field("kill_grace", &self.kill_grace)
            .field("output_callback", &self.output_callback.is_some())
            .finish()
    }
}

/// Read a pipe to EOF, one line at a time, into `lines`.
///
/// Invalid UTF-8 is replaced rather than aborting the read.
async fn collect_lines<R>(stream: Option<R>, callback: Option<OutputCallback>, lines: SharedLines)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                slog_trace!("> {}", line);
                if let Some(callback) = &callback {
                    callback(&line);
                }
                lines
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(line);
            }
            Err(e) => {
                slog_debug!("collect_lines: read error: {}", e);
                break;
            }
        }
    }
}

fn snapshot(lines: &SharedLines) -> Vec<String> {
    lines
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Wait up to [`READER_DRAIN`] for a reader task, then return what it read.
///
/// A reader still blocked at the limit is aborted and its partial output
/// kept. A reader that panicked (in the output callback) is an error.
async fn drain(task: &mut JoinHandle<()>, lines: &SharedLines) -> Result<Vec<String>> {
    match tokio::time::timeout(READER_DRAIN, &mut *task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            slog_warn!("output reader failed: {}", e);
            return Err(Error::TaskJoin(e.to_string()));
        }
        Err(_) => {
            task.abort();
            slog_warn!(
                "output pipe still open {:?} after exit, keeping what was read",
                READER_DRAIN
            );
        }
    }
    Ok(snapshot(lines))
}
