//! Top-level run: resolve the target, fork the two workers, supervise them
//! and combine their exit codes.

use crate::runlog::RunLog;
use anyhow::{Context as _, Result};
use collector::exchange::socket_pair;
use collector::sink::{bundle_filename, default_filename, BUNDLE_PREFIX, BUNDLE_SUFFIX};
use collector::{
    detect_platform, local_hostname, resolve_target_identity, shutdown_signal, Consumer, Context,
    HostCollection, MainWorker, PrivilegeDropper, PrivilegedCollection, Producer, RootWorker,
};
use config::{Catalogs, Options, Platform, Timeouts};
use model::{ExitCode, Identity};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::fs;
use std::future::Future;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How often the parent checks on its children.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of a complete run.
#[derive(Debug)]
pub struct RunOutcome {
    pub code: ExitCode,
    pub bundle: PathBuf,
}

/// Everything the workers need, fixed before forking.
pub struct Orchestrator {
    options: Options,
    catalogs: Catalogs,
    hostname: String,
    platform: Platform,
    elevated: bool,
}

impl Orchestrator {
    pub fn new(options: Options, catalogs: Catalogs) -> Self {
        Self {
            options,
            catalogs,
            hostname: local_hostname(),
            platform: detect_platform(),
            elevated: nix::unistd::geteuid().is_root(),
        }
    }

    /// Where the bundle will be written.
    ///
    /// Always absolute: the collection worker changes directory when it
    /// drops privilege.
    pub fn bundle_path(&self) -> PathBuf {
        let path = match &self.options.filename {
            Some(name) => bundle_filename(name),
            None => default_filename(&self.options.tempdir, &self.hostname),
        };
        if path.is_absolute() {
            return path;
        }
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path,
        }
    }

    /// Resolve the target, fork both workers and wait for them.
    ///
    /// Must be called while the process is single threaded.
    pub fn run(&self, run_log: &RunLog) -> Result<RunOutcome> {
        let bundle = self.bundle_path();
        info!(
            host = %self.hostname,
            platform = %self.platform,
            bundle = %bundle.display(),
            "Starting collection"
        );

        let target = if self.elevated {
            match resolve_target_identity(self.options.user.as_deref()) {
                Ok(target) => {
                    run_log.hand_over(&target)?;
                    Some(target)
                }
                Err(e) => {
                    error!(error = %e, "Cannot resolve the target user");
                    return Ok(RunOutcome { code: e.exit_code(), bundle });
                }
            }
        } else {
            if let Some(user) = &self.options.user {
                warn!(user = %user, "Not running as root, ignoring the target user");
            }
            None
        };

        let (producer_end, consumer_end) =
            socket_pair().context("Failed to create the exchange socket pair")?;

        let root = match unsafe { fork() }.context("Failed to fork the privileged worker")? {
            ForkResult::Child => {
                drop(consumer_end);
                let code = self.root_child(producer_end);
                std::process::exit(code.code());
            }
            ForkResult::Parent { child } => child,
        };
        drop(producer_end);
        debug!(pid = %root, "Privileged worker started");

        let main = match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let code = self.main_child(consumer_end, target, &bundle, run_log.path());
                std::process::exit(code.code());
            }
            Ok(ForkResult::Parent { child }) => child,
            Err(e) => {
                let _ = kill(root, Signal::SIGKILL);
                let _ = waitpid(root, None);
                return Err(e).context("Failed to fork the collection worker");
            }
        };
        drop(consumer_end);
        debug!(pid = %main, "Collection worker started");

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build the supervisor runtime")?;
        let status = runtime.block_on(supervise(main, root, &self.options.timeouts));

        let code = combine(status.main, status.root, status.interrupted);
        info!(
            main = %status.main,
            root = %status.root,
            code = %code,
            "Collection finished"
        );
        Ok(RunOutcome { code, bundle })
    }

    fn context(&self, user: &str) -> Context {
        Context::new(self.options.clone(), &self.catalogs, self.platform.clone(), user)
    }

    fn root_child(&self, end: UnixStream) -> ExitCode {
        let tasks = PrivilegedCollection::new(self.context("root"));
        let options = self.options.clone();
        let elevated = self.elevated;
        in_runtime(async move {
            let producer = match Producer::from_std(end) {
                Ok(producer) => producer,
                Err(e) => {
                    error!(error = %e, "Cannot attach the exchange");
                    return ExitCode::ChannelFull;
                }
            };
            let mut worker = RootWorker::new(&options, producer).elevated(elevated);
            worker.run_until(&tasks, shutdown_signal()).await
        })
    }

    fn main_child(
        &self,
        end: UnixStream,
        target: Option<Identity>,
        bundle: &Path,
        log_path: &Path,
    ) -> ExitCode {
        let user = match &target {
            Some(target) => target.username.clone(),
            None => collector::privilege::current_identity().username,
        };
        let local = HostCollection::new(self.context(&user));
        let options = self.options.clone();
        let bundle = bundle.to_path_buf();
        let log_path = log_path.to_path_buf();
        let hostname = self.hostname.clone();
        let platform = self.platform.clone();
        in_runtime(async move {
            let consumer = match Consumer::from_std(end) {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!(error = %e, "Cannot attach the exchange");
                    return ExitCode::SetupFailed;
                }
            };
            let dropper = PrivilegeDropper::new().require_readable(&log_path);
            let mut worker = MainWorker::new(options, consumer, bundle)
                .target(target)
                .dropper(dropper)
                .hostname(hostname)
                .platform(platform)
                .log_path(log_path);
            worker.run_until(&local, shutdown_signal()).await
        })
    }
}

/// Run a worker future on a fresh single threaded runtime.
///
/// The future runs in its own task; a panic that escapes the worker shows up
/// as a failed join and becomes [`ExitCode::Bug`].
fn in_runtime<F>(work: F) -> ExitCode
where
    F: Future<Output = ExitCode> + Send + 'static,
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Cannot build the worker runtime");
            return ExitCode::Bug;
        }
    };
    runtime.block_on(async move {
        match tokio::spawn(work).await {
            Ok(code) => code,
            Err(e) => {
                error!(error = %e, "Worker task failed");
                ExitCode::Bug
            }
        }
    })
}

/// Final status of both children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    pub main: ExitCode,
    pub root: ExitCode,
    pub interrupted: bool,
}

/// A forked worker as seen from the parent.
struct Child {
    name: &'static str,
    pid: Pid,
    status: Option<ExitCode>,
}

impl Child {
    fn new(name: &'static str, pid: Pid) -> Self {
        Self { name, pid, status: None }
    }

    /// Reap the child if it has exited.
    fn poll(&mut self) -> Option<ExitCode> {
        if self.status.is_none() {
            self.status = match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => None,
                Ok(status) => exit_code_of(status),
                Err(Errno::ECHILD) => Some(ExitCode::Bug),
                Err(e) => {
                    warn!(worker = self.name, error = %e, "waitpid failed");
                    None
                }
            };
            if let Some(code) = self.status {
                debug!(worker = self.name, code = %code, "Worker exited");
            }
        }
        self.status
    }

    fn signal(&self, signal: Signal) {
        if self.status.is_none() {
            match kill(self.pid, signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(worker = self.name, error = %e, "Cannot signal worker"),
            }
        }
    }

    /// SIGKILL and reap.
    fn kill(&mut self) -> ExitCode {
        if let Some(code) = self.poll() {
            return code;
        }
        warn!(worker = self.name, pid = %self.pid, "Worker did not finish in time, killing it");
        self.signal(Signal::SIGKILL);
        let code = match waitpid(self.pid, None) {
            Ok(status) => exit_code_of(status).unwrap_or(ExitCode::Bug),
            Err(_) => ExitCode::Bug,
        };
        // a killed worker failed whatever it last reported
        let code = if code == ExitCode::Interrupted { code } else { ExitCode::Bug };
        self.status = Some(code);
        code
    }
}

/// Map a wait status to the worker's exit code.
fn exit_code_of(status: WaitStatus) -> Option<ExitCode> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitCode::from_code(code).unwrap_or(ExitCode::Bug)),
        WaitStatus::Signaled(_, Signal::SIGINT | Signal::SIGTERM, _) => Some(ExitCode::Interrupted),
        WaitStatus::Signaled(..) => Some(ExitCode::Bug),
        _ => None,
    }
}

/// Wait for the collection worker up to `run`, then the privileged worker up
/// to `join`. An operator interrupt is forwarded as SIGTERM and both workers
/// get `join` more to finish.
async fn supervise(main: Pid, root: Pid, timeouts: &Timeouts) -> WorkerStatus {
    let mut main = Child::new("main", main);
    let mut root = Child::new("root", root);
    let signal = shutdown_signal();
    tokio::pin!(signal);
    let mut interrupted = false;

    let main_code = wait_for(
        &mut main,
        &mut root,
        timeouts.run,
        timeouts.join,
        signal.as_mut(),
        &mut interrupted,
    )
    .await;
    let root_code = wait_for(
        &mut root,
        &mut main,
        timeouts.join,
        timeouts.join,
        signal.as_mut(),
        &mut interrupted,
    )
    .await;

    WorkerStatus { main: main_code, root: root_code, interrupted }
}

async fn wait_for(
    child: &mut Child,
    other: &mut Child,
    limit: Duration,
    grace: Duration,
    mut signal: Pin<&mut impl Future<Output = ()>>,
    interrupted: &mut bool,
) -> ExitCode {
    let mut deadline = Instant::now() + limit;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut signal, if !*interrupted => {
                *interrupted = true;
                warn!("Interrupted, stopping workers");
                child.signal(Signal::SIGTERM);
                other.signal(Signal::SIGTERM);
                deadline = deadline.min(Instant::now() + grace);
            }
            _ = ticker.tick() => {}
        }

        other.poll();
        if let Some(code) = child.poll() {
            return code;
        }
        if Instant::now() >= deadline {
            return child.kill();
        }
    }
}

/// Combine the worker exit codes into the run's exit code.
///
/// The collection worker decides: its success is the run's success whatever
/// the privileged worker did.
pub fn combine(main: ExitCode, root: ExitCode, interrupted: bool) -> ExitCode {
    if interrupted {
        return ExitCode::Interrupted;
    }
    match main {
        ExitCode::Success => {
            if !root.is_success() {
                warn!(root = %root, "Privileged worker failed, bundle lacks privileged data");
            }
            ExitCode::Success
        }
        ExitCode::SetupFailed | ExitCode::IdentityUnavailable | ExitCode::Interrupted => main,
        _ if root.is_success() => ExitCode::WorkerFailed,
        _ => ExitCode::BothWorkersFailed,
    }
}

/// Delete old bundles from `tempdir`, returning how many were removed.
pub fn cleanup(tempdir: &Path) -> Result<usize> {
    let mut removed = 0;
    let entries =
        fs::read_dir(tempdir).with_context(|| format!("Cannot read {}", tempdir.display()))?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !(name.starts_with(BUNDLE_PREFIX) && name.ends_with(BUNDLE_SUFFIX)) {
            continue;
        }
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "Removed old bundle");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot remove bundle"),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_main_success_wins() {
        for root in ExitCode::ALL {
            assert_eq!(combine(ExitCode::Success, root, false), ExitCode::Success);
        }
    }

    #[test]
    fn test_combine_passes_setup_failures_through() {
        for main in [
            ExitCode::SetupFailed,
            ExitCode::IdentityUnavailable,
            ExitCode::Interrupted,
        ] {
            assert_eq!(combine(main, ExitCode::Success, false), main);
            assert_eq!(combine(main, ExitCode::ChannelFull, false), main);
        }
    }

    #[test]
    fn test_combine_worker_failures() {
        for main in [
            ExitCode::CollectFailed,
            ExitCode::ChannelFull,
            ExitCode::WorkerFailed,
            ExitCode::Bug,
        ] {
            assert_eq!(combine(main, ExitCode::Success, false), ExitCode::WorkerFailed);
            assert_eq!(combine(main, ExitCode::ChannelFull, false), ExitCode::BothWorkersFailed);
            assert_eq!(combine(main, ExitCode::Bug, false), ExitCode::BothWorkersFailed);
        }
    }

    #[test]
    fn test_combine_interrupt() {
        assert_eq!(
            combine(ExitCode::Success, ExitCode::Success, true),
            ExitCode::Interrupted
        );
        assert_eq!(combine(ExitCode::Bug, ExitCode::Bug, true), ExitCode::Interrupted);
    }

    #[test]
    fn test_exit_code_of_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(exit_code_of(WaitStatus::Exited(pid, 0)), Some(ExitCode::Success));
        assert_eq!(exit_code_of(WaitStatus::Exited(pid, 45)), Some(ExitCode::ChannelFull));
        assert_eq!(exit_code_of(WaitStatus::Exited(pid, 3)), Some(ExitCode::Bug));
        assert_eq!(
            exit_code_of(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            Some(ExitCode::Interrupted)
        );
        assert_eq!(
            exit_code_of(WaitStatus::Signaled(pid, Signal::SIGSEGV, true)),
            Some(ExitCode::Bug)
        );
        assert_eq!(exit_code_of(WaitStatus::StillAlive), None);
    }

    #[test]
    fn test_bundle_path() {
        let mut options = Options::default().with_tempdir("/var/tmp");
        let orchestrator = Orchestrator::new(options.clone(), Catalogs::builtin());
        let default = orchestrator.bundle_path();
        assert!(default.starts_with("/var/tmp"));
        assert!(default.to_string_lossy().ends_with(".tar.gz"));

        options.filename = Some(PathBuf::from("/srv/case-1234"));
        let orchestrator = Orchestrator::new(options.clone(), Catalogs::builtin());
        assert_eq!(orchestrator.bundle_path(), PathBuf::from("/srv/case-1234.tar.gz"));

        options.filename = Some(PathBuf::from("case-1234.tar.gz"));
        let orchestrator = Orchestrator::new(options, Catalogs::builtin());
        assert!(orchestrator.bundle_path().is_absolute());
    }

    #[test]
    fn test_cleanup_removes_only_bundles() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("dbcollect-db01-20240101_0000.tar.gz"), b"x").unwrap();
        fs::write(dir.path().join("dbcollect-1234.log"), b"x").unwrap();
        fs::write(dir.path().join("other.tar.gz"), b"x").unwrap();

        assert_eq!(cleanup(dir.path()).unwrap(), 1);
        assert!(dir.path().join("dbcollect-1234.log").exists());
        assert!(dir.path().join("other.tar.gz").exists());
        assert_eq!(cleanup(dir.path()).unwrap(), 0);
    }
}
