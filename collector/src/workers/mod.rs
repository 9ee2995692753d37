//! The two worker state machines.
//!
//! The [`RootWorker`] runs privileged collection and pushes records into the
//! exchange. The [`MainWorker`] drops privilege, drains the exchange into the
//! bundle and then runs the unprivileged collection.

pub mod main;
pub mod root;

use crate::error::Result;
use async_trait::async_trait;
use model::Record;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

pub use main::{LocalCollection, MainState, MainWorker};
pub use root::{ChannelEmitter, RootState, RootTasks, RootWorker};

/// Destination for records produced by a collector.
#[async_trait]
pub trait RecordEmitter: Send {
    /// Hand over one record.
    ///
    /// An error means the destination is unusable and collection should stop.
    async fn emit(&mut self, record: Record) -> Result<()>;
}

/// Collects emitted records in memory.
#[async_trait]
impl RecordEmitter for Vec<Record> {
    async fn emit(&mut self, record: Record) -> Result<()> {
        self.push(record);
        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Cannot install signal handlers");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}
