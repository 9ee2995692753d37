//! AIX, Solaris and HP-UX host collection.
//!
//! These systems keep binary SAR files that only the local `sar` can read,
//! so text reports are produced per file instead of copying the data.

use super::files::{directory_listing, regular_files};
use super::linux::is_sar_file;
use super::{capture_files, run_commands, tolerate, Context};
use crate::error::Result;
use crate::sink::Sink;
use crate::workers::RecordEmitter;
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

pub const SAR_DIRS: [&str; 2] = ["/var/adm/sa", "/var/log/sa"];

/// Report kind and the `sar` flags producing it.
pub const SAR_REPORTS: [(&str, &str); 4] = [
    ("cpu", "-uf"),
    ("block", "-bf"),
    ("disk", "-df"),
    ("swap", "-rf"),
];

pub async fn collect(ctx: &Context, sink: &mut Sink) -> Result<()> {
    info!(platform = %ctx.platform, "Collecting host information");

    run_commands(ctx, &ctx.catalog.commands, "cmd", sink).await?;
    capture_files(&ctx.catalog.files, sink).await?;

    if ctx.options.no_sar {
        info!("Skipping SAR");
        return Ok(());
    }
    collect_sar(ctx, sink).await
}

async fn collect_sar(ctx: &Context, sink: &mut Sink) -> Result<()> {
    let dirs: Vec<PathBuf> = SAR_DIRS.iter().map(PathBuf::from).collect();
    info!("Collecting SAR reports");
    tolerate(sink.write_json("sarinfo.json", &json!({ "directories": directory_listing(&dirs) })))?;

    for dir in &dirs {
        for path in regular_files(dir) {
            let Some(file) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !is_sar_file(&file) {
                continue;
            }
            let source = path.display().to_string();
            for (kind, flag) in SAR_REPORTS {
                let record = ctx
                    .args_record(format!("sar/{}_{}.jsonp", file, kind), "sar", &[flag, &source])
                    .await;
                sink.emit(record).await?;
            }
        }
    }
    Ok(())
}
