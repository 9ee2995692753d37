//! Platform collectors.
//!
//! The platform is detected once at startup and selects one collection path.
//! Everything a collector needs is carried in a [`Context`]; the catalogs it
//! reads are never modified.
//!
//! - [`HostCollection`]: unprivileged host and database collection, run by
//!   the main worker
//! - [`PrivilegedCollection`]: accounting and privileged commands, run by
//!   the root worker

pub mod accounting;
pub mod database;
pub mod files;
pub mod linux;
pub mod meta;
pub mod nmon;
pub mod root;
pub mod unix;

use crate::error::{Error, Result};
use crate::runner::{CommandOutput, CommandRunner};
use crate::sink::Sink;
use crate::workers::{LocalCollection, RecordEmitter};
use async_trait::async_trait;
use config::{Catalog, Catalogs, Options, Platform};
use indexmap::IndexMap;
use model::{Record, Status};
use std::path::Path;
use tracing::{debug, info, warn};

pub use database::DatabaseCollector;
pub use meta::RunMeta;
pub use root::PrivilegedCollection;

/// Platform of the running system.
pub fn detect_platform() -> Platform {
    match nix::sys::utsname::uname() {
        Ok(uts) => Platform::from_sysname(&uts.sysname().to_string_lossy()),
        Err(e) => {
            warn!(error = %e, "uname failed");
            Platform::Unknown(String::new())
        }
    }
}

/// Short host name used for bundle names and entry prefixes.
pub fn local_hostname() -> String {
    let name = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    name.split('.').next().unwrap_or(&name).to_string()
}

/// Treat a refused duplicate entry as written.
pub(crate) fn tolerate(result: Result<()>) -> Result<()> {
    match result {
        Err(Error::DuplicateEntry(_)) => Ok(()),
        other => other,
    }
}

/// Copy a file verbatim. Only a failing archive is an error; a file that
/// cannot be read is logged and skipped.
pub(crate) fn store_file(sink: &mut Sink, path: &Path) -> Result<()> {
    match sink.store_file(path) {
        Err(Error::Unreadable { reason, .. }) => {
            warn!(path = %path.display(), error = %reason, "Cannot read file, not stored");
            Ok(())
        }
        other => tolerate(other),
    }
}

/// Everything a collector reads.
#[derive(Debug, Clone)]
pub struct Context {
    pub options: Options,
    pub catalog: Catalog,
    pub platform: Platform,
    pub runner: CommandRunner,
    /// Name recorded as the user commands ran as
    pub user: String,
}

impl Context {
    pub fn new(options: Options, catalogs: &Catalogs, platform: Platform, user: impl Into<String>) -> Self {
        let runner = CommandRunner::new(options.timeouts.command);
        Self {
            catalog: catalogs.for_platform(&platform),
            options,
            platform,
            runner,
            user: user.into(),
        }
    }

    /// Run a catalog command line unless its program is skipped.
    pub async fn command_record(&self, name: String, command_line: &str) -> Record {
        let output = if self.options.is_skipped(command_line) {
            info!(command = %command_line, "Skipping command");
            CommandOutput::skipped(command_line, "skipped on request")
        } else {
            debug!(command = %command_line, "Running command");
            self.runner.run(command_line).await
        };
        report(&output);
        output.into_record(name, &self.user)
    }

    /// Run a program with explicit arguments unless it is skipped.
    pub async fn args_record(&self, name: String, program: &str, args: &[&str]) -> Record {
        let output = if self.options.is_skipped(program) {
            CommandOutput::skipped(program, "skipped on request")
        } else {
            self.runner.run_args(program, args).await
        };
        report(&output);
        output.into_record(name, &self.user)
    }
}

fn report(output: &CommandOutput) {
    if output.status.is_failure() {
        warn!(
            command = %output.command,
            status = %output.status,
            reason = output.reason.as_deref().unwrap_or(""),
            "Command did not succeed"
        );
    }
}

/// Run every command of a table, naming records `<prefix>/<tag>.jsonp`.
pub async fn run_commands(
    ctx: &Context,
    commands: &IndexMap<String, String>,
    prefix: &str,
    emit: &mut dyn RecordEmitter,
) -> Result<()> {
    for (tag, command_line) in commands {
        let record = ctx
            .command_record(format!("{}/{}.jsonp", prefix, tag), command_line)
            .await;
        emit.emit(record).await?;
    }
    Ok(())
}

/// Capture every listed file.
pub async fn capture_files(files: &[String], emit: &mut dyn RecordEmitter) -> Result<()> {
    for file in files {
        emit.emit(files::file_record(Path::new(file))).await?;
    }
    Ok(())
}

/// Unprivileged collection for the detected platform.
#[derive(Debug, Clone)]
pub struct HostCollection {
    ctx: Context,
}

impl HostCollection {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

#[async_trait]
impl LocalCollection for HostCollection {
    async fn collect(&self, sink: &mut Sink) -> Result<()> {
        let ctx = &self.ctx;
        if ctx.options.no_sys {
            info!("Skipping host collection");
        } else {
            match &ctx.platform {
                Platform::Linux => linux::collect(ctx, sink).await?,
                Platform::Aix | Platform::SunOs | Platform::HpUx => unix::collect(ctx, sink).await?,
                Platform::Unknown(name) => {
                    warn!(platform = %name, "Unsupported platform, no host data collected");
                    sink.emit(
                        Record::new("platform.jsonp", Status::Error)
                            .with_meta("platform", name.as_str())
                            .with_meta("reason", "unsupported platform"),
                    )
                    .await?;
                }
            }
            if !ctx.options.nmon.is_empty() {
                nmon::collect(&ctx.options.nmon, sink)?;
            }
        }

        if ctx.options.no_ora {
            info!("Skipping database collection");
        } else {
            DatabaseCollector::new(ctx).collect(sink).await?;
        }
        Ok(())
    }
}
