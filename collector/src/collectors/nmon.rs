//! NMON performance reports.

use super::files::{directory_listing, regular_files, starts_with};
use super::{store_file, tolerate};
use crate::error::Result;
use crate::sink::Sink;
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// First bytes of every NMON report.
pub const NMON_SIGNATURE: &[u8] = b"AAA,progname";

/// Whether `path` holds an NMON report.
pub fn is_nmon_report(path: &Path) -> bool {
    starts_with(path, NMON_SIGNATURE)
}

/// List the directories, then store every NMON report in them.
pub fn collect(dirs: &[PathBuf], sink: &mut Sink) -> Result<()> {
    info!("Collecting NMON reports");
    tolerate(sink.write_json("nmoninfo.json", &directory_listing(dirs)))?;

    for dir in dirs {
        if !dir.is_dir() {
            error!(dir = %dir.display(), "NMON directory not found");
            continue;
        }
        for path in regular_files(dir) {
            if is_nmon_report(&path) {
                store_file(sink, &path)?;
            } else {
                info!(path = %path.display(), "Not an NMON file, skipped");
            }
        }
    }
    Ok(())
}
