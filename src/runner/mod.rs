//! External tool execution
//!
//! Tools run as child processes with stdin closed and both output pipes
//! drained by reader threads. The caller polls for exit, the time limit or
//! cancellation. On unix each tool leads its own process group, and a stopped
//! tool's group gets SIGTERM, a grace period, then SIGKILL; its output is
//! never treated as a result.
//!
//! The pipeline only sees the [`ToolRunner`] trait, so tests drive it with
//! in-process fakes.

use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::signal::CancellationToken;
use crate::timeout::{TimeoutConfig, TimeoutEnforcer};

/// Lines of output kept per stream
pub const MAX_CAPTURED_LINES: usize = 200;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long reader threads may keep draining once the tool is gone
const DRAIN_LIMIT: Duration = Duration::from_secs(2);

/// Shown in place of secret arguments
const MASK: &str = "********";

/// A tool invocation
#[derive(Debug, Clone, Default)]
pub struct ToolCommand {
    /// Short name used in logs and failure messages (e.g. "apktool")
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Indexes into `args` that must not be displayed
    secret_args: Vec<usize>,
}

impl ToolCommand {
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add `flag value` where `value` is masked in [`ToolCommand::display`].
    pub fn secret_arg(mut self, flag: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.args.push(flag.into());
        self.secret_args.push(self.args.len());
        self.args.push(value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Command line for logs, with secrets masked
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        for (i, arg) in self.args.iter().enumerate() {
            if self.secret_args.contains(&i) {
                parts.push(MASK.to_string());
            } else {
                parts.push(arg.to_string_lossy().into_owned());
            }
        }
        parts.join(" ")
    }

    /// Arguments as lossy strings, unmasked
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display())
    }
}

/// Limits applied to one invocation
#[derive(Debug, Clone)]
pub struct RunLimits {
    pub timeout: Duration,
    pub termination_grace: Duration,
    pub cancel: CancellationToken,
}

impl RunLimits {
    pub fn new(config: &TimeoutConfig, cancel: CancellationToken) -> Self {
        Self {
            timeout: config.timeout(),
            termination_grace: config.grace(),
            cancel,
        }
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self::new(&TimeoutConfig::default(), CancellationToken::new())
    }
}

/// Result of a tool that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code; `None` if the process was ended by a signal
    pub exit_code: Option<i32>,
    pub success: bool,
    /// Last stdout lines
    pub stdout: Vec<String>,
    /// Last stderr lines
    pub stderr: Vec<String>,
    pub duration: Duration,
}

impl ToolOutput {
    /// Successful output with no captured lines
    pub fn succeeded() -> Self {
        Self {
            exit_code: Some(0),
            success: true,
            ..Self::default()
        }
    }

    /// Failed output with the given exit code
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            success: code == 0,
            ..Self::default()
        }
    }

    /// Last `n` lines of stderr, or of stdout if stderr is empty
    pub fn tail(&self, n: usize) -> String {
        let lines = if self.stderr.is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

/// Errors from running a tool
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Runs external tools
pub trait ToolRunner: Send + Sync {
    fn run(&self, command: &ToolCommand, limits: &RunLimits) -> Result<ToolOutput, RunnerError>;
}

/// Runs tools as child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ToolRunner for ProcessRunner {
    fn run(&self, command: &ToolCommand, limits: &RunLimits) -> Result<ToolOutput, RunnerError> {
        if limits.cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }
        debug!(tool = %command.label, command = %command.display(), "starting tool");

        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &command.current_dir {
            process.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            process.process_group(0);
        }

        let mut child = process.spawn().map_err(|source| RunnerError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        let enforcer = TimeoutEnforcer::new(limits.timeout);

        let stdout = Arc::new(Mutex::new(VecDeque::new()));
        let stderr = Arc::new(Mutex::new(VecDeque::new()));
        let stdout_handle = child
            .stdout
            .take()
            .map(|pipe| drain(pipe, command.label.clone(), "stdout", Arc::clone(&stdout)));
        let stderr_handle = child
            .stderr
            .take()
            .map(|pipe| drain(pipe, command.label.clone(), "stderr", Arc::clone(&stderr)));

        let status = loop {
            if limits.cancel.is_cancelled() {
                warn!(tool = %command.label, "cancelling tool");
                terminate_child(&mut child, limits.termination_grace)?;
                join(stdout_handle, stderr_handle, DRAIN_LIMIT);
                return Err(RunnerError::Cancelled);
            }
            if enforcer.check().is_timeout() {
                warn!(tool = %command.label, limit = ?enforcer.limit(), "tool timed out");
                terminate_child(&mut child, limits.termination_grace)?;
                join(stdout_handle, stderr_handle, DRAIN_LIMIT);
                return Err(RunnerError::Timeout {
                    after: enforcer.limit(),
                });
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        join(stdout_handle, stderr_handle, DRAIN_LIMIT);
        let output = ToolOutput {
            exit_code: status.code(),
            success: status.success(),
            stdout: take_lines(&stdout),
            stderr: take_lines(&stderr),
            duration: enforcer.elapsed(),
        };
        debug!(
            tool = %command.label,
            exit_code = ?output.exit_code,
            elapsed_ms = output.duration.as_millis() as u64,
            "tool exited"
        );
        Ok(output)
    }
}

/// Read `pipe` line by line, logging each line and keeping the last ones.
fn drain<R: Read + Send + 'static>(
    pipe: R,
    label: String,
    stream: &'static str,
    sink: Arc<Mutex<VecDeque<String>>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(pipe);
        for line in reader.lines().map_while(Result::ok) {
            debug!(tool = %label, stream, "{}", line);
            let mut lines = sink.lock().unwrap_or_else(|e| e.into_inner());
            if lines.len() == MAX_CAPTURED_LINES {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    })
}

/// Join the reader threads, giving up after `limit`.
///
/// A process that inherited the pipes can hold them open after the tool
/// itself is gone; its readers are left detached.
fn join(stdout: Option<JoinHandle<()>>, stderr: Option<JoinHandle<()>>, limit: Duration) {
    let deadline = Instant::now() + limit;
    for handle in [stdout, stderr].into_iter().flatten() {
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            debug!("output pipe still open, detaching reader");
        }
    }
}

fn take_lines(lines: &Mutex<VecDeque<String>>) -> Vec<String> {
    let mut lines = lines.lock().unwrap_or_else(|e| e.into_inner());
    lines.drain(..).collect()
}

/// Terminate a child and its process group gracefully then forcefully.
fn terminate_child(child: &mut Child, grace: Duration) -> io::Result<()> {
    signal_group(child, true);

    let start = Instant::now();
    while start.elapsed() < grace {
        if child.try_wait()?.is_some() {
            // Stragglers in the group do not get a grace period of their own.
            signal_group(child, false);
            return Ok(());
        }
        thread::sleep(POLL_INTERVAL);
    }

    signal_group(child, false);
    let _ = child.kill();
    let _ = child.wait();
    Ok(())
}

/// SIGTERM (`graceful`) or SIGKILL the child's process group.
#[cfg(unix)]
fn signal_group(child: &mut Child, graceful: bool) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = if graceful {
        Signal::SIGTERM
    } else {
        Signal::SIGKILL
    };
    // The child was spawned with process_group(0), so its pid is the pgid.
    let _ = killpg(Pid::from_raw(child.id() as i32), signal);
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _graceful: bool) {
    let _ = child.kill();
}
