//! dbcollect collection pipeline
//!
//! Two workers at different privilege levels cooperate to produce one
//! bundle:
//!
//! - **Exchange**: handshake plus bounded, credit based channel between the
//!   workers, carried over a Unix socket pair
//! - **RootWorker**: privileged producer; never touches the bundle
//! - **MainWorker**: drops privilege, drains the exchange into the bundle and
//!   runs the unprivileged collection
//! - **CommandRunner** / **InteractiveSession**: external programs under
//!   enforced time limits
//! - **PrivilegeDropper**: the one-way switch to the target identity
//! - **Sink**: the single writer of the gzip compressed tar bundle
//!
//! Every wait is bounded, so neither worker can hang the run when the other
//! one stalls or dies.

pub mod collectors;
pub mod error;
pub mod exchange;
pub mod instances;
pub mod privilege;
pub mod runner;
pub mod session;
pub mod sink;
pub mod workers;

pub use collectors::{detect_platform, local_hostname, Context, HostCollection, PrivilegedCollection};
pub use error::{Error, Result};
pub use exchange::{Consumer, Message, Producer, CHANNEL_CAPACITY};
pub use privilege::{resolve_target_identity, DropOutcome, PrivilegeDropper};
pub use runner::{CommandOutput, CommandRunner};
pub use session::{InteractiveSession, SessionSpec};
pub use sink::Sink;
pub use workers::{
    shutdown_signal, LocalCollection, MainState, MainWorker, RecordEmitter, RootState, RootTasks,
    RootWorker,
};
