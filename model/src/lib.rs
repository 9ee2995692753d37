//! Shared data types for dbcollect.
//!
//! - [`Record`] and [`Status`]: named units of collected data
//! - [`Identity`] and [`Group`]: process identities before and after the
//!   privilege drop
//! - [`ExitCode`]: the stable exit status contract

pub mod exit;
pub mod group;
pub mod identity;
pub mod record;

pub use exit::ExitCode;
pub use group::Group;
pub use identity::Identity;
pub use record::{timestamp, Metadata, Record, Status, APPLICATION};
