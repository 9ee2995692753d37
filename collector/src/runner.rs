//! Bounded execution of external programs.
//!
//! Every command runs with a fixed, minimal environment and a wall-clock
//! limit. The runner never returns an error: spawn failures, nonzero exits
//! and timeouts all come back as a [`CommandOutput`] with the matching
//! [`Status`], so a flaky or missing program never aborts a run.

use model::{Record, Status};
use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Search path for every command.
pub const SEARCH_PATH: &str = "/usr/sbin:/usr/bin:/bin:/sbin:/opt/freeware/bin";

/// How long to keep reading output after the child is gone.
const READ_GRACE: Duration = Duration::from_millis(500);

/// Outcome of one command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Command line as it was run
    pub command: String,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code; `None` on timeout, spawn failure or death by signal
    pub exit_code: Option<i32>,
    pub status: Status,
    /// Why the command did not succeed
    pub reason: Option<String>,
    pub elapsed: Duration,
}

impl CommandOutput {
    /// Output for a command that was not run on purpose.
    pub fn skipped(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
            status: Status::Skipped,
            reason: Some(reason.into()),
            elapsed: Duration::ZERO,
        }
    }

    fn error(command: String, reason: String, elapsed: Duration) -> Self {
        Self {
            command,
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
            status: Status::Error,
            reason: Some(reason),
            elapsed,
        }
    }

    pub fn success(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr split into lines, as recorded in metadata.
    pub fn error_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.stderr)
            .lines()
            .map(|l| l.to_string())
            .collect()
    }

    /// Turn the output into a record named `name`.
    pub fn into_record(self, name: impl Into<String>, user: &str) -> Record {
        let errors = self.error_lines();
        let mut record = Record::new(name, self.status)
            .with_meta("command", self.command)
            .with_meta("user", user)
            .with_meta("returncode", self.exit_code)
            .with_meta("elapsed", self.elapsed.as_secs_f64());
        if !errors.is_empty() {
            record = record.with_meta("errors", errors);
        }
        if let Some(reason) = self.reason {
            record = record.with_meta("reason", reason);
        }
        record.with_payload(self.stdout)
    }
}

/// Runs external programs under a timeout.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl CommandRunner {
    /// Create a runner with the base environment.
    pub fn new(timeout: Duration) -> Self {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), SEARCH_PATH.to_string());
        // AIX device database
        env.insert("ODMDIR".to_string(), "/etc/objrepos".to_string());
        // XPG4 ps options on HP-UX
        env.insert("UNIX95".to_string(), "true".to_string());
        Self {
            timeout,
            env,
            working_dir: None,
        }
    }

    /// Add or replace one environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Run a command line. Words are split on whitespace; no shell is involved.
    pub async fn run(&self, command_line: &str) -> CommandOutput {
        let mut words = command_line.split_whitespace();
        let Some(program) = words.next() else {
            return CommandOutput::error(
                command_line.to_string(),
                "empty command".to_string(),
                Duration::ZERO,
            );
        };
        let args: Vec<&str> = words.collect();
        self.execute(program, &args, None).await
    }

    /// Run a program with explicit arguments.
    pub async fn run_args(&self, program: &str, args: &[&str]) -> CommandOutput {
        self.execute(program, args, None).await
    }

    /// Run a program and feed `input` on its stdin.
    pub async fn run_with_stdin(&self, program: &str, args: &[&str], input: Vec<u8>) -> CommandOutput {
        self.execute(program, args, Some(input)).await
    }

    async fn execute(&self, program: &str, args: &[&str], input: Option<Vec<u8>>) -> CommandOutput {
        let command_line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        let start = Instant::now();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(&self.env)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = describe_io_error(&e);
                debug!(command = %command_line, reason = %reason, "Command could not be started");
                return CommandOutput::error(command_line, reason, start.elapsed());
            }
        };

        let stdout = Capture::start(child.stdout.take());
        let stderr = Capture::start(child.stderr.take());

        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            tokio::spawn(async move {
                // EPIPE when the child exits early is expected
                let _ = stdin.write_all(&data).await;
                let _ = stdin.shutdown().await;
            });
        }

        let (status, exit_code, reason) = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(exit)) => match (exit.code(), exit.signal()) {
                (Some(0), _) => (Status::Ok, Some(0), None),
                (Some(code), _) => (Status::Failed, Some(code), Some(format!("exit code {}", code))),
                (None, Some(sig)) => (Status::Failed, None, Some(format!("terminated by signal {}", sig))),
                (None, None) => (Status::Failed, None, Some("terminated".to_string())),
            },
            Ok(Err(e)) => (Status::Error, None, Some(describe_io_error(&e))),
            Err(_) => {
                warn!(command = %command_line, timeout = ?self.timeout, "Command timed out");
                if let Err(e) = child.start_kill() {
                    debug!(command = %command_line, error = %e, "Kill after timeout failed");
                }
                let _ = child.wait().await;
                (
                    Status::Timeout,
                    None,
                    Some(format!("timed out after {:?}", self.timeout)),
                )
            }
        };

        CommandOutput {
            command: command_line,
            stdout: stdout.finish().await,
            stderr: stderr.finish().await,
            exit_code,
            status,
            reason,
            elapsed: start.elapsed(),
        }
    }
}

/// Background reader that keeps whatever arrived, even if the pipe never
/// closes.
struct Capture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl Capture {
    fn start<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let task = pipe.map(|mut pipe| {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Ok(mut buf) = buffer.lock() {
                                buf.extend_from_slice(&chunk[..n]);
                            }
                        }
                    }
                }
            })
        });
        Self { buffer, task }
    }

    async fn finish(mut self) -> Vec<u8> {
        if let Some(mut task) = self.task.take() {
            // A grandchild may still hold the pipe open
            if tokio::time::timeout(READ_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        match self.buffer.lock() {
            Ok(mut buf) => std::mem::take(&mut *buf),
            Err(_) => Vec::new(),
        }
    }
}

/// Human readable reason for an OS level failure.
pub fn describe_io_error(e: &std::io::Error) -> String {
    match e.raw_os_error() {
        Some(code) => nix::errno::Errno::from_i32(code).desc().to_string(),
        None => e.to_string(),
    }
}
