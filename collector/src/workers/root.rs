//! The privileged producer.
//!
//! ```text
//! WaitReady -> Collecting -> SignalDone -> Exited
//!     |            |
//!     +------------+--------> Aborted
//! ```
//!
//! The sentinel is attempted on every way out, so the consumer never waits
//! for it longer than it has to.

use super::RecordEmitter;
use crate::error::{Error, Result};
use crate::exchange::Producer;
use async_trait::async_trait;
use config::{Options, Timeouts};
use futures::FutureExt;
use model::{ExitCode, Record};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Privileged collection steps.
#[async_trait]
pub trait RootTasks: Send + Sync {
    /// Produce records. Errors from `emit` must be returned unchanged.
    async fn collect(&self, emit: &mut dyn RecordEmitter) -> Result<()>;
}

/// Emits records into the exchange, one bounded send each.
pub struct ChannelEmitter<'a> {
    producer: &'a mut Producer,
    timeout: Duration,
}

impl<'a> ChannelEmitter<'a> {
    pub fn new(producer: &'a mut Producer, timeout: Duration) -> Self {
        Self { producer, timeout }
    }
}

#[async_trait]
impl RecordEmitter for ChannelEmitter<'_> {
    async fn emit(&mut self, record: Record) -> Result<()> {
        self.producer.send(record, self.timeout).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootState {
    WaitReady,
    Collecting,
    SignalDone,
    Exited,
    Aborted,
}

pub struct RootWorker {
    producer: Producer,
    timeouts: Timeouts,
    no_root: bool,
    elevated: bool,
    state: RootState,
}

impl RootWorker {
    pub fn new(options: &Options, producer: Producer) -> Self {
        Self {
            producer,
            timeouts: options.timeouts.clone(),
            no_root: options.no_root,
            elevated: nix::unistd::geteuid().is_root(),
            state: RootState::WaitReady,
        }
    }

    /// Override the detected privilege level.
    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    pub fn state(&self) -> RootState {
        self.state
    }

    /// Records pushed so far.
    pub fn sent(&self) -> usize {
        self.producer.sent()
    }

    pub async fn run(&mut self, tasks: &dyn RootTasks) -> ExitCode {
        self.run_until(tasks, std::future::pending()).await
    }

    /// Run until done or until `cancel` resolves.
    pub async fn run_until<C>(&mut self, tasks: &dyn RootTasks, cancel: C) -> ExitCode
    where
        C: Future<Output = ()>,
    {
        let outcome = {
            let work = self.work(tasks);
            tokio::pin!(work);
            tokio::pin!(cancel);
            tokio::select! {
                code = &mut work => Some(code),
                _ = &mut cancel => None,
            }
        };

        match outcome {
            Some(code) => code,
            None => {
                warn!(state = ?self.state, "Privileged worker interrupted");
                self.state = RootState::Aborted;
                if let Err(e) = self.producer.send_done(Duration::ZERO).await {
                    debug!(error = %e, "Sentinel not delivered");
                }
                self.producer.drain();
                ExitCode::Interrupted
            }
        }
    }

    async fn work(&mut self, tasks: &dyn RootTasks) -> ExitCode {
        if self.no_root || !self.elevated {
            info!(
                no_root = self.no_root,
                elevated = self.elevated,
                "Privileged collection disabled"
            );
            return self.finish(ExitCode::Success).await;
        }

        self.state = RootState::WaitReady;
        match self.producer.wait_ready(self.timeouts.handshake).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    timeout = ?self.timeouts.handshake,
                    "Collection worker not ready, skipping privileged collection"
                );
                return self.finish(ExitCode::Success).await;
            }
            Err(e) => return self.abort(e).await,
        }

        self.state = RootState::Collecting;
        let mut emitter = ChannelEmitter::new(&mut self.producer, self.timeouts.send);
        let result = AssertUnwindSafe(tasks.collect(&mut emitter))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(())) => {
                info!(records = self.producer.sent(), "Privileged collection complete");
                self.finish(ExitCode::Success).await
            }
            Ok(Err(e)) if e.is_channel_fault() => self.abort(e).await,
            Ok(Err(e)) => {
                error!(error = %e, "Privileged collection failed");
                let code = e.exit_code();
                self.finish(code).await
            }
            Err(_) => {
                error!("Privileged collection panicked");
                self.finish(ExitCode::Bug).await
            }
        }
    }

    /// Send the sentinel, drain and exit with `code`.
    async fn finish(&mut self, code: ExitCode) -> ExitCode {
        self.state = RootState::SignalDone;
        if let Err(e) = self.producer.send_done(self.timeouts.send).await {
            return self.abort(e).await;
        }
        self.producer.drain();
        self.state = if code.is_success() {
            RootState::Exited
        } else {
            RootState::Aborted
        };
        code
    }

    /// Leave after a channel fault.
    async fn abort(&mut self, e: Error) -> ExitCode {
        error!(error = %e, sent = self.producer.sent(), "Exchange unusable, privileged worker aborts");
        self.state = RootState::Aborted;
        let _ = self.producer.send_done(Duration::ZERO).await;
        self.producer.drain();
        e.exit_code()
    }
}
