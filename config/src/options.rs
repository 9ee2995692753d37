//! Run options handed from the command line to the collection core.

use crate::Timeouts;
use std::path::PathBuf;

/// Fallback directory for bundles and the run log.
pub const DEFAULT_TEMPDIR: &str = "/tmp";

/// Everything a run needs to know about what the operator asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    /// Explicit user to switch to
    pub user: Option<String>,
    /// Bundle path; derived from host name and time when not set
    pub filename: Option<PathBuf>,
    /// Directory for the bundle and the run log
    pub tempdir: PathBuf,
    /// Suppress console progress output
    pub quiet: bool,
    /// Verbose console output and print the run log at the end
    pub debug: bool,
    /// Skip privileged collection
    pub no_root: bool,
    /// Skip process accounting
    pub no_acct: bool,
    /// Skip SAR data
    pub no_sar: bool,
    /// Skip operating system collection
    pub no_sys: bool,
    /// Skip database collection
    pub no_ora: bool,
    /// ORACLE_HOME directories for instances missing from oratab
    pub orahome: Vec<PathBuf>,
    /// Only collect these database instances, when not empty
    pub include: Vec<String>,
    /// Never collect these database instances
    pub exclude: Vec<String>,
    /// Programs that must not be run
    pub skip_cmd: Vec<String>,
    /// Directories holding NMON reports
    pub nmon: Vec<PathBuf>,
    /// Wall-clock limits
    pub timeouts: Timeouts,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            user: None,
            filename: None,
            tempdir: PathBuf::from(DEFAULT_TEMPDIR),
            quiet: false,
            debug: false,
            no_root: false,
            no_acct: false,
            no_sar: false,
            no_sys: false,
            no_ora: false,
            orahome: Vec::new(),
            include: Vec::new(),
            exclude: Vec::new(),
            skip_cmd: Vec::new(),
            nmon: Vec::new(),
            timeouts: Timeouts::default(),
        }
    }
}

impl Options {
    /// Whether a command line must not be run.
    ///
    /// Matches the program name (the first word, without directory) against
    /// the skip list.
    pub fn is_skipped(&self, command_line: &str) -> bool {
        let Some(program) = command_line.split_whitespace().next() else {
            return false;
        };
        let program = program.rsplit('/').next().unwrap_or(program);
        self.skip_cmd.iter().any(|skip| skip == program)
    }

    /// Whether database instance `sid` should be collected.
    pub fn wants_instance(&self, sid: &str) -> bool {
        if self.exclude.iter().any(|s| s == sid) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|s| s == sid)
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_tempdir(mut self, tempdir: impl Into<PathBuf>) -> Self {
        self.tempdir = tempdir.into();
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}
