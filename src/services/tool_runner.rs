//! Pluggable executor for external tools (esptool, PlatformIO, git, build scripts)

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How often a running tool checks the cancel flag
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One external command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// File fed to the tool's stdin (e.g. a patch for `git apply`)
    pub stdin_file: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin_from(mut self, file: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(file.into());
        self
    }

    /// Same invocation with a different program name
    pub fn with_program(&self, program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..self.clone()
        }
    }

    /// Shell-like rendering for logs
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Per-invocation plumbing: cooperative cancel flag and live output lines
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub cancel: Option<Arc<AtomicBool>>,
    pub lines: Option<mpsc::UnboundedSender<String>>,
}

impl RunContext {
    pub fn with_lines(lines: mpsc::UnboundedSender<String>) -> Self {
        Self {
            cancel: None,
            lines: Some(lines),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Forward a line to the listener, if any
    pub fn emit(&self, line: impl Into<String>) {
        if let Some(tx) = &self.lines {
            let _ = tx.send(line.into());
        }
    }
}

/// Captured result of a tool that ran to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// stdout followed by stderr
    pub output: String,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            output: output.into(),
        }
    }

    pub fn failed(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            output: output.into(),
        }
    }
}

/// A tool that did not run to completion
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolFailure {
    #[error("{0} not found")]
    NotFound(String),
    #[error("Timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("Cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(String),
}

/// Executes external commands under a wall-clock bound
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run `command`; on timeout or cancel the process must be terminated
    /// before this returns.
    async fn run(
        &self,
        command: &ToolCommand,
        timeout: Duration,
        ctx: &RunContext,
    ) -> Result<ToolOutput, ToolFailure>;
}

/// Try each program name in turn until one exists
pub async fn run_with_fallback(
    runner: &dyn ToolRunner,
    programs: &[String],
    command: &ToolCommand,
    timeout: Duration,
    ctx: &RunContext,
) -> Result<ToolOutput, ToolFailure> {
    for program in programs {
        let attempt = command.with_program(program.as_str());
        match runner.run(&attempt, timeout, ctx).await {
            Err(ToolFailure::NotFound(_)) => {
                log::debug!("{} not available, trying next candidate", program);
                continue;
            }
            other => return other,
        }
    }
    Err(ToolFailure::NotFound(programs.join(" / ")))
}

/// Production runner backed by `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(
        &self,
        command: &ToolCommand,
        timeout: Duration,
        ctx: &RunContext,
    ) -> Result<ToolOutput, ToolFailure> {
        log::debug!("🔨 Executing: {}", command.display());

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }
        match &command.stdin_file {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .map_err(|e| ToolFailure::Io(format!("{}: {}", path.display(), e)))?;
                cmd.stdin(Stdio::from(file));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ToolFailure::NotFound(command.program.clone())
            } else {
                ToolFailure::Io(format!("Failed to start {}: {}", command.program, e))
            }
        })?;
        let mut group = ProcessGroup::new(child.id());

        let stdout_task = child
            .stdout
            .take()
            .map(|out| spawn_line_reader(out, ctx.lines.clone()));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| spawn_line_reader(err, ctx.lines.clone()));

        let deadline = tokio::time::Instant::now() + timeout;
        let mut poll = tokio::time::interval(CANCEL_POLL_INTERVAL);

        let stopped = loop {
            tokio::select! {
                status = child.wait() => {
                    break Ok(status.map_err(|e| ToolFailure::Io(e.to_string()))?);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break Err(ToolFailure::TimedOut(timeout));
                }
                _ = poll.tick() => {
                    if ctx.is_cancelled() {
                        break Err(ToolFailure::Cancelled);
                    }
                }
            }
        };

        let status = match stopped {
            Ok(status) => status,
            Err(failure) => {
                log::warn!("⏹️  Terminating {}: {}", command.program, failure);
                group.kill();
                if let Err(e) = child.kill().await {
                    log::error!("Failed to kill {}: {}", command.program, e);
                }
                for task in [stdout_task, stderr_task].into_iter().flatten() {
                    task.abort();
                }
                return Err(failure);
            }
        };

        group.disarm();
        let mut output = String::new();
        for task in [stdout_task, stderr_task].into_iter().flatten() {
            output.push_str(&task.await.unwrap_or_default());
        }

        Ok(ToolOutput {
            success: status.success(),
            exit_code: status.code(),
            output,
        })
    }
}

/// The tool's process group, including compilers and helpers it forked.
/// Killed as a whole unless the tool exited on its own.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }

    #[cfg(unix)]
    fn kill(&mut self) {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Some(pgid) = self.pgid.take() {
            #[allow(clippy::cast_possible_wrap)]
            let group = Pid::from_raw(pgid as i32);
            if let Err(e) = killpg(group, Signal::SIGKILL) {
                log::debug!("Process group {} already gone: {}", pgid, e);
            }
        }
    }

    #[cfg(not(unix))]
    fn kill(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

fn spawn_line_reader<R>(reader: R, lines: Option<mpsc::UnboundedSender<String>>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut collected = String::new();
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buffer);
                    let line = text.trim_end_matches(['\r', '\n']);
                    if let Some(tx) = &lines {
                        let _ = tx.send(line.to_string());
                    }
                    collected.push_str(line);
                    collected.push('\n');
                }
            }
        }
        collected
    })
}
