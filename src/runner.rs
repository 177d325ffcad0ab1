//! Child process lifecycle: spawn with piped stdio, bounded wait, guaranteed kill.

use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::artifact::SourceArtifact;
use crate::config::Config;
use crate::error::ExecError;
use crate::language::{CommandLine, Language};

/// Owns one running child. The process group is torn down exactly once,
/// either by [`ProcessGuard::terminate`] or when the guard is dropped.
#[derive(Debug)]
pub struct ProcessGuard {
    child: Child,
    program: String,
    pid: u32,
    /// The leader has been waited on, so its pid no longer pins the group id.
    reaped: bool,
    terminated: bool,
    kill_signals: usize,
}

/// The three standard streams of a spawned child.
#[derive(Debug)]
pub struct ProcessPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Captured output of a run-to-completion execution.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Start `command` in `cwd` with all three streams piped.
///
/// The child leads a fresh process group so anything it forks dies with it.
pub fn spawn(command: &CommandLine, cwd: &Path) -> Result<ProcessGuard, ExecError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    let child = cmd.spawn().map_err(|source| ExecError::Spawn {
        program: command.program.clone(),
        source,
    })?;
    let pid = child
        .id()
        .ok_or_else(|| ExecError::runtime("child exited before its pid was read"))?;
    info!(pid, program = %command.program, args = ?command.args, "Process spawned");

    Ok(ProcessGuard {
        child,
        program: command.program.clone(),
        pid,
        reaped: false,
        terminated: false,
        kill_signals: 0,
    })
}

impl ProcessGuard {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Number of kill signals sent so far. Never exceeds one, and stays zero
    /// when the group had already emptied out on its own.
    pub fn kill_signals(&self) -> usize {
        self.kill_signals
    }

    /// Hand out the stdio pipes. Only the first call succeeds.
    pub fn take_pipes(&mut self) -> Result<ProcessPipes, ExecError> {
        let stdin = self.child.stdin.take();
        let stdout = self.child.stdout.take();
        let stderr = self.child.stderr.take();
        match (stdin, stdout, stderr) {
            (Some(stdin), Some(stdout), Some(stderr)) => Ok(ProcessPipes {
                stdin,
                stdout,
                stderr,
            }),
            _ => Err(ExecError::runtime("process pipes already taken")),
        }
    }

    /// Wait for the child to exit on its own. Cancel safe.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.reaped = true;
        Ok(status)
    }

    /// Kill the process group and reap the child. Later calls do nothing.
    pub async fn terminate(&mut self) {
        if !self.signal_group() {
            return;
        }
        match self.child.wait().await {
            Ok(status) => debug!(pid = self.pid, ?status, "Process reaped"),
            Err(e) => warn!(pid = self.pid, error = %e, "Reaping process failed"),
        }
    }

    fn signal_group(&mut self) -> bool {
        if self.terminated {
            return false;
        }
        self.terminated = true;
        let group = Pid::from_raw(self.pid as i32);

        // Once the leader is reaped its pid is only held while some member
        // keeps the group alive. An empty group's id may already be reused.
        if self.reaped && killpg(group, None) == Err(Errno::ESRCH) {
            debug!(pid = self.pid, "Process group already empty");
            return false;
        }

        self.kill_signals += 1;
        match killpg(group, Signal::SIGKILL) {
            Ok(()) => debug!(pid = self.pid, "SIGKILL sent to process group"),
            Err(Errno::ESRCH) => debug!(pid = self.pid, "Process group already gone"),
            Err(e) => {
                warn!(pid = self.pid, program = %self.program, error = %e, "killpg failed, killing child only");
                let _ = self.child.start_kill();
            }
        }
        true
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        // kill_on_drop takes care of reaping
        self.signal_group();
    }
}

/// Run `code` once with `input` on stdin and collect everything it prints.
///
/// The source file and the process are cleaned up on every path.
pub async fn run_to_completion(
    config: &Config,
    language: Language,
    code: &str,
    input: &str,
) -> Result<RunResult, ExecError> {
    let mut artifact = SourceArtifact::materialize(&config.temp_dir, language.suffix(), code)?;
    let command = language.command(config, artifact.path());
    let mut process = spawn(&command, &config.temp_dir)?;

    let result = collect(&mut process, input, config.exec_timeout).await;

    process.terminate().await;
    artifact.release();
    match &result {
        Ok(run) => info!(pid = process.pid(), exit_code = ?run.exit_code, "Run finished"),
        Err(e) => warn!(pid = process.pid(), error = %e, "Run failed"),
    }
    result
}

async fn collect(
    process: &mut ProcessGuard,
    input: &str,
    limit: Duration,
) -> Result<RunResult, ExecError> {
    let ProcessPipes {
        mut stdin,
        mut stdout,
        mut stderr,
    } = process.take_pipes()?;

    let feed = async move {
        // A program that never reads stdin closes the pipe early
        if let Err(e) = stdin.write_all(input.as_bytes()).await {
            debug!(error = %e, "stdin closed before input was written");
        }
    };
    let read_stdout = async {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await.map(|_| buf)
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await.map(|_| buf)
    };

    let run = async {
        let ((), out, err, status) = tokio::join!(feed, read_stdout, read_stderr, process.wait());
        let status = status.map_err(|e| ExecError::runtime(format!("wait: {e}")))?;
        let out = out.map_err(|e| ExecError::runtime(format!("read stdout: {e}")))?;
        let err = err.map_err(|e| ExecError::runtime(format!("read stderr: {e}")))?;
        Ok(RunResult {
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
            exit_code: status.code(),
        })
    };

    match tokio::time::timeout(limit, run).await {
        Ok(result) => result,
        Err(_) => Err(ExecError::Timeout { limit }),
    }
}
