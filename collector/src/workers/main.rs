//! The collecting consumer.
//!
//! ```text
//! Start -> DropPrivilege -> OpenSink -> DrainExchange -> CollectLocal -> Finalize -> Closed
//! ```
//!
//! Nothing is written before the sink is open, so failing before that point
//! ends the run without a bundle. From then on the bundle is always closed,
//! whatever happens to the collection phases.

use super::RecordEmitter;
use crate::collectors::meta::{RunMeta, META_ENTRY};
use crate::collectors::{detect_platform, local_hostname};
use crate::error::{Error, Result};
use crate::exchange::{Consumer, Message};
use crate::privilege::{current_identity, DropOutcome, PrivilegeDropper};
use crate::sink::{Sink, LOG_ENTRY};
use async_trait::async_trait;
use config::{Options, Platform};
use futures::FutureExt;
use model::{ExitCode, Identity};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Unprivileged collection steps, writing straight into the bundle.
#[async_trait]
pub trait LocalCollection: Send + Sync {
    /// Errors mean the bundle can no longer be written.
    async fn collect(&self, sink: &mut Sink) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainState {
    Start,
    DropPrivilege,
    OpenSink,
    DrainExchange,
    CollectLocal,
    Finalize,
    Closed,
    Failed,
}

enum Fault {
    Sink(Error),
    Panic,
}

pub struct MainWorker {
    options: Options,
    consumer: Consumer,
    bundle: PathBuf,
    target: Option<Identity>,
    dropper: PrivilegeDropper,
    hostname: String,
    platform: Platform,
    log_path: Option<PathBuf>,
    state: MainState,
    written: Option<PathBuf>,
}

impl MainWorker {
    /// Worker writing the bundle to `bundle`.
    pub fn new(options: Options, consumer: Consumer, bundle: impl Into<PathBuf>) -> Self {
        Self {
            options,
            consumer,
            bundle: bundle.into(),
            target: None,
            dropper: PrivilegeDropper::new(),
            hostname: local_hostname(),
            platform: detect_platform(),
            log_path: None,
            state: MainState::Start,
            written: None,
        }
    }

    /// Identity to switch to before anything is written.
    pub fn target(mut self, target: Option<Identity>) -> Self {
        self.target = target;
        self
    }

    pub fn dropper(mut self, dropper: PrivilegeDropper) -> Self {
        self.dropper = dropper;
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Run log embedded as the last entry.
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn state(&self) -> MainState {
        self.state
    }

    /// Path of the closed bundle.
    pub fn bundle(&self) -> Option<&Path> {
        self.written.as_deref()
    }

    pub async fn run(&mut self, local: &dyn LocalCollection) -> ExitCode {
        self.run_until(local, std::future::pending()).await
    }

    /// Run until done or until `cancel` resolves. A cancelled run still
    /// writes the run log and closes the bundle.
    pub async fn run_until<C>(&mut self, local: &dyn LocalCollection, cancel: C) -> ExitCode
    where
        C: Future<Output = ()>,
    {
        self.state = MainState::DropPrivilege;
        if let Some(target) = self.target.clone() {
            match self.dropper.drop_to(&target) {
                Ok(DropOutcome::Dropped) => {}
                Ok(DropOutcome::AlreadyUnprivileged) => {
                    info!(user = %current_identity(), "Running unprivileged")
                }
                Err(e) => return self.fail(e),
            }
        }

        self.state = MainState::OpenSink;
        let mut sink = match Sink::open(&self.bundle, &self.hostname) {
            Ok(sink) => sink,
            Err(e) => return self.fail(e),
        };

        let meta = RunMeta::new(&self.hostname, &self.platform, &current_identity());
        if let Err(e) = sink.write_json(META_ENTRY, &meta) {
            warn!(error = %e, "Cannot write run metadata");
        }

        let outcome = {
            let phases = self.collect(&mut sink, local);
            tokio::pin!(phases);
            tokio::pin!(cancel);
            tokio::select! {
                result = &mut phases => Some(result),
                _ = &mut cancel => None,
            }
        };
        if outcome.is_none() {
            warn!(state = ?self.state, "Collection interrupted, finishing bundle");
            self.consumer.drain();
        }

        let closed = self.finalize(sink);
        match (outcome, closed) {
            (None, _) => ExitCode::Interrupted,
            (Some(Err(Fault::Panic)), _) => ExitCode::Bug,
            (Some(Err(Fault::Sink(e))), _) => {
                error!(error = %e, "Bundle incomplete");
                match e.exit_code() {
                    ExitCode::Bug => ExitCode::Bug,
                    _ => ExitCode::CollectFailed,
                }
            }
            (Some(Ok(())), Err(_)) => ExitCode::CollectFailed,
            (Some(Ok(())), Ok(())) => ExitCode::Success,
        }
    }

    fn fail(&mut self, e: Error) -> ExitCode {
        error!(error = %e, state = ?self.state, "Collection cannot start");
        self.state = MainState::Failed;
        self.consumer.drain();
        e.exit_code()
    }

    async fn collect(&mut self, sink: &mut Sink, local: &dyn LocalCollection) -> std::result::Result<(), Fault> {
        self.state = MainState::DrainExchange;
        self.drain_exchange(sink).await.map_err(Fault::Sink)?;

        self.state = MainState::CollectLocal;
        match AssertUnwindSafe(local.collect(sink)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Fault::Sink(e)),
            Err(_) => {
                error!("Local collection panicked");
                Err(Fault::Panic)
            }
        }
    }

    /// Write privileged records until the sentinel, a timeout or a closed
    /// channel. Only a failing sink is an error.
    async fn drain_exchange(&mut self, sink: &mut Sink) -> Result<()> {
        let timeout = self.options.timeouts.receive;

        if let Err(e) = self.consumer.signal_ready().await {
            warn!(error = %e, "Privileged worker not reachable");
            self.consumer.drain();
            return Ok(());
        }

        loop {
            match self.consumer.receive(timeout).await {
                Ok(Message::Record(record)) => sink.emit(record).await?,
                Ok(Message::Done) => {
                    info!(records = self.consumer.received(), "Privileged data received");
                    break;
                }
                Err(Error::ChannelEmpty(waited)) => {
                    error!(
                        waited = ?waited,
                        records = self.consumer.received(),
                        "No data from privileged worker, continuing without it"
                    );
                    break;
                }
                Err(Error::ChannelClosed) => {
                    warn!(
                        records = self.consumer.received(),
                        "Privileged worker went away before finishing"
                    );
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Exchange failed");
                    break;
                }
            }
        }
        self.consumer.drain();
        Ok(())
    }

    /// Embed the run log and close the bundle.
    fn finalize(&mut self, mut sink: Sink) -> Result<()> {
        self.state = MainState::Finalize;
        if let Some(ref log) = self.log_path {
            match std::fs::read(log) {
                Ok(data) => {
                    if let Err(e) = sink.write_entry(LOG_ENTRY, &data) {
                        warn!(error = %e, "Cannot embed run log");
                    }
                }
                Err(e) => warn!(path = %log.display(), error = %e, "Cannot read run log"),
            }
        }

        match sink.close() {
            Ok(path) => {
                info!(path = %path.display(), "Bundle written");
                self.written = Some(path);
                self.state = MainState::Closed;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Cannot finish bundle");
                self.state = MainState::Failed;
                Err(e)
            }
        }
    }
}
