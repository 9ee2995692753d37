//! Long-lived interactive sessions.
//!
//! An [`InteractiveSession`] keeps one external program (typically a SQL
//! client) running and feeds it statements over stdin. After each batch of
//! statements the session sends a marker statement and reads stdout until
//! the marker comes back, so the answer to every batch can be told apart.
//! Stderr is discarded; the wrapped tools report errors on stdout.

use crate::error::{Error, Result};
use crate::runner::{describe_io_error, SEARCH_PATH};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Placeholder replaced by the marker in marker statements.
pub const MARKER_PLACEHOLDER: &str = "{marker}";

/// Marker statement understood by SQL*Plus.
pub const SQLPLUS_MARKER: &str = "prompt {marker}";

/// How long `close` waits for the program to exit on its own.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// How to start a session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    timeout: Duration,
    reply_timeout: Option<Duration>,
    wrapper: Option<PathBuf>,
    marker_statement: String,
}

impl SessionSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), SEARCH_PATH.to_string());
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env,
            timeout: Duration::from_secs(600),
            reply_timeout: None,
            wrapper: Some(config::paths::timeout_wrapper()),
            marker_statement: SQLPLUS_MARKER.to_string(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Lifetime limit for the whole session, enforced by the wrapper.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Limit for a single `send`. Defaults to the session timeout.
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = Some(timeout);
        self
    }

    /// External wall-clock wrapper, `None` to never use one.
    pub fn wrapper(mut self, wrapper: Option<PathBuf>) -> Self {
        self.wrapper = wrapper;
        self
    }

    /// Statement echoing its argument, with `{marker}` as placeholder.
    pub fn marker_statement(mut self, statement: impl Into<String>) -> Self {
        self.marker_statement = statement.into();
        self
    }

    /// Start the program.
    pub async fn open(self) -> Result<InteractiveSession> {
        let program = self.program.display().to_string();
        let wrapper = self.wrapper.as_ref().filter(|w| w.is_file());

        let mut cmd = match wrapper {
            Some(wrapper) => {
                let mut cmd = Command::new(wrapper);
                cmd.arg(self.timeout.as_secs().max(1).to_string())
                    .arg(&self.program);
                cmd
            }
            None => {
                info!(program = %program, "Timeout not detected, session runs without time limit");
                Command::new(&self.program)
            }
        };
        cmd.args(&self.args)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| Error::Spawn {
            program: program.clone(),
            reason: describe_io_error(&e),
        })?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| Error::SessionClosed(format!("{}: no stdout", program)))?;

        // the wrapper leads its own group, so the wrapped program dies with it
        let group = child.id().map(|pid| Pid::from_raw(pid as i32));
        debug!(program = %program, pid = ?child.id(), "Session started");

        Ok(InteractiveSession {
            program,
            child,
            group,
            stdin,
            stdout,
            reply_timeout: self.reply_timeout.unwrap_or(self.timeout),
            marker_statement: self.marker_statement,
            sequence: 0,
            closed: false,
        })
    }
}

/// A running interactive program.
#[derive(Debug)]
pub struct InteractiveSession {
    program: String,
    child: Child,
    group: Option<Pid>,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    reply_timeout: Duration,
    marker_statement: String,
    sequence: u64,
    closed: bool,
}

impl InteractiveSession {
    /// Start `program` with SQL*Plus defaults.
    pub async fn open(program: impl Into<PathBuf>, args: &[&str], working_dir: &Path) -> Result<Self> {
        SessionSpec::new(program)
            .args(args.iter().copied())
            .working_dir(working_dir)
            .open()
            .await
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Send statements and return everything printed in reply.
    pub async fn send(&mut self, statements: &str) -> Result<String> {
        self.sequence += 1;
        let marker = format!("DBCOLLECT_END_{}_{}", std::process::id(), self.sequence);
        let marker_line = self.marker_statement.replace(MARKER_PLACEHOLDER, &marker);

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::SessionClosed(format!("{}: input closed", self.program)))?;

        let mut input = String::with_capacity(statements.len() + marker_line.len() + 2);
        input.push_str(statements);
        if !statements.ends_with('\n') {
            input.push('\n');
        }
        input.push_str(&marker_line);
        input.push('\n');

        let write = async {
            stdin.write_all(input.as_bytes()).await?;
            stdin.flush().await
        };
        write.await.map_err(|e| Error::SessionClosed(format!("{}: {}", self.program, e)))?;

        let stdout = &mut self.stdout;
        let read = async {
            let mut reply = String::new();
            let mut line = String::new();
            loop {
                line.clear();
                let n = stdout.read_line(&mut line).await?;
                if n == 0 {
                    return Ok::<_, std::io::Error>((reply, false));
                }
                if line.trim_end() == marker {
                    return Ok((reply, true));
                }
                reply.push_str(&line);
            }
        };

        match tokio::time::timeout(self.reply_timeout, read).await {
            Ok(Ok((reply, true))) => Ok(reply),
            Ok(Ok((reply, false))) => {
                warn!(program = %self.program, "Session ended before answering");
                Err(Error::SessionClosed(format!(
                    "{} exited, partial reply: {} bytes",
                    self.program,
                    reply.len()
                )))
            }
            Ok(Err(e)) => Err(Error::SessionClosed(format!("{}: {}", self.program, e))),
            Err(_) => {
                warn!(program = %self.program, timeout = ?self.reply_timeout, "Session did not answer in time");
                Err(Error::SessionTimeout(self.reply_timeout))
            }
        }
    }

    /// Close stdin and wait for the program to exit, killing it if needed.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stdin.take();

        match tokio::time::timeout(CLOSE_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(program = %self.program, status = ?status, "Session closed"),
            Ok(Err(e)) => warn!(program = %self.program, error = %e, "Failed to reap session"),
            Err(_) => {
                warn!(program = %self.program, "Session ignored end of input, killing it");
                self.kill_group();
                if let Err(e) = self.child.kill().await {
                    warn!(program = %self.program, error = %e, "Failed to kill session");
                }
            }
        }
    }

    /// SIGKILL every process of the session. Only valid before the leader
    /// has been reaped.
    fn kill_group(&self) {
        if let Some(group) = self.group {
            if let Err(e) = killpg(group, Signal::SIGKILL) {
                debug!(program = %self.program, error = %e, "Cannot kill session group");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for InteractiveSession {
    fn drop(&mut self) {
        if !self.closed {
            self.kill_group();
        }
    }
}
