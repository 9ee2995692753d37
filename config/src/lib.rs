//! dbcollect configuration
//!
//! Everything the collection core reads but never changes:
//!
//! - [`options`]: the run options selected on the command line
//! - [`timeouts`]: wall-clock limits for every bounded wait
//! - [`catalog`]: per-platform tables of commands, files and queries
//! - [`loader`]: the optional TOML configuration file
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use dbcollect_config::{ConfigLoader, Platform};
//!
//! let config = ConfigLoader::system().load().unwrap();
//! let linux = config.catalogs.for_platform(&Platform::Linux);
//! for (tag, cmd) in &linux.commands {
//!     println!("{}: {}", tag, cmd);
//! }
//! ```

pub mod catalog;
pub mod error;
pub mod loader;
pub mod options;
pub mod timeouts;

pub use catalog::{Catalog, Catalogs, Platform};
pub use error::{ConfigError, Result};
pub use loader::{paths, ConfigFile, ConfigLoader, LoadedConfig};
pub use options::{Options, DEFAULT_TEMPDIR};
pub use timeouts::Timeouts;
