//! Command line definition.

use clap::{CommandFactory, Parser};
use clap_complete::Shell;
use config::{Options, Timeouts, DEFAULT_TEMPDIR};
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for `--timeout`, one week.
const MAX_SQL_MINUTES: u64 = 7 * 24 * 60;

/// Collect host and database diagnostics into a single portable bundle.
///
/// Run as root for the full data set: privileged data is collected by a
/// separate worker while everything else runs as the database owner.
#[derive(Parser, Debug)]
#[command(name = "dbcollect")]
#[command(author, about, long_about = None, disable_version_flag = true)]
pub struct Cli {
    /// Switch to this user instead of the detected database owner
    #[arg(short, long, env = "DBCOLLECT_USER")]
    pub user: Option<String>,

    /// Bundle file name (.tar.gz is appended when missing)
    #[arg(short = 'o', long)]
    pub filename: Option<PathBuf>,

    /// Directory for the bundle and the run log
    #[arg(long, default_value = DEFAULT_TEMPDIR)]
    pub tempdir: PathBuf,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,

    /// Verbose output, print the run log at the end
    #[arg(short, long)]
    pub debug: bool,

    /// Configuration file with timeouts and catalog overrides
    #[arg(short, long, env = "DBCOLLECT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database query timeout in minutes
    #[arg(
        long,
        value_name = "MINUTES",
        value_parser = clap::value_parser!(u64).range(1..=MAX_SQL_MINUTES)
    )]
    pub timeout: Option<u64>,

    /// Skip privileged collection
    #[arg(long)]
    pub no_root: bool,

    /// Skip process accounting
    #[arg(long)]
    pub no_acct: bool,

    /// Skip SAR data
    #[arg(long)]
    pub no_sar: bool,

    /// Skip operating system collection
    #[arg(long)]
    pub no_sys: bool,

    /// Skip database collection
    #[arg(long)]
    pub no_ora: bool,

    /// ORACLE_HOME directories for instances not in oratab
    #[arg(long, value_delimiter = ',', value_name = "DIR")]
    pub orahome: Vec<PathBuf>,

    /// Only collect these instances
    #[arg(long, value_delimiter = ',', value_name = "SID")]
    pub include: Vec<String>,

    /// Never collect these instances
    #[arg(long, value_delimiter = ',', value_name = "SID")]
    pub exclude: Vec<String>,

    /// Programs that must not be run
    #[arg(long, value_delimiter = ',', value_name = "PROGRAM")]
    pub skip_cmd: Vec<String>,

    /// Directories holding NMON reports
    #[arg(long, value_delimiter = ',', value_name = "DIR")]
    pub nmon: Vec<PathBuf>,

    /// Remove old bundles from the temp directory and exit
    #[arg(long)]
    pub cleanup: bool,

    /// Explain an exit code and exit
    #[arg(long, value_name = "CODE")]
    pub explain: Option<i32>,

    /// Print shell completions and exit
    #[arg(long, value_name = "SHELL")]
    pub completions: Option<Shell>,

    /// Print version information and exit
    #[arg(short = 'V', long)]
    pub version: bool,
}

impl Cli {
    /// The run options, with `timeouts` from the configuration.
    pub fn options(&self, mut timeouts: Timeouts) -> Options {
        if let Some(minutes) = self.timeout {
            timeouts.sql = Duration::from_secs(minutes.saturating_mul(60));
        }
        Options {
            user: self.user.clone(),
            filename: self.filename.clone(),
            tempdir: self.tempdir.clone(),
            quiet: self.quiet,
            debug: self.debug,
            no_root: self.no_root,
            no_acct: self.no_acct,
            no_sar: self.no_sar,
            no_sys: self.no_sys,
            no_ora: self.no_ora,
            orahome: self.orahome.clone(),
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            skip_cmd: self.skip_cmd.clone(),
            nmon: self.nmon.clone(),
            timeouts,
        }
    }

    /// Write completions for `shell` to stdout.
    pub fn print_completions(shell: Shell) {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
    }
}

/// Text for `--version`.
pub fn version_text() -> String {
    format!(
        "dbcollect {}\nAuthor:    {}\nCopyright: {}\nLicense:   {}",
        env!("CARGO_PKG_VERSION"),
        env!("CARGO_PKG_AUTHORS"),
        "the dbcollect developers",
        env!("CARGO_PKG_LICENSE"),
    )
}
