//! Process accounting, decoded with `sa`.
//!
//! Rotated accounting files are often gzip compressed, which `sa` cannot
//! read. Those are decompressed here and fed to `sa` on stdin.

use super::files::{file_info, is_gzip, regular_files};
use crate::error::Result;
use crate::runner::{CommandOutput, CommandRunner};
use crate::workers::RecordEmitter;
use flate2::read::GzDecoder;
use model::{Record, Status};
use serde_json::Value;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const ACCOUNTING_DIRS: [&str; 2] = ["/var/account", "/var/log/account"];

const SA_PROGRAM: &str = "sa";
const SA_ARGS: [&str; 3] = ["-a", "-b", "-j"];

/// Accounting files in `dirs`; bzip2 archives are left alone.
pub fn accounting_files(dirs: &[PathBuf]) -> Vec<PathBuf> {
    dirs.iter()
        .flat_map(|dir| regular_files(dir))
        .filter(|path| path.extension().map_or(true, |ext| ext != "tbz2"))
        .collect()
}

fn record_name(path: &Path) -> String {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("cmd_root/sa-{}.jsonp", base)
}

fn decompress(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut data = Vec::new();
    GzDecoder::new(File::open(path)?).read_to_end(&mut data)?;
    Ok(data)
}

/// Decode one accounting file.
pub async fn accounting_record(runner: &CommandRunner, path: &Path, user: &str) -> Record {
    let name = record_name(path);
    let source = path.display().to_string();

    let mut output = if is_gzip(path) {
        match decompress(path) {
            Ok(data) => {
                let mut args: Vec<&str> = SA_ARGS.to_vec();
                args.push("-");
                runner.run_with_stdin(SA_PROGRAM, &args, data).await
            }
            Err(e) => {
                warn!(path = %source, error = %e, "Cannot decompress accounting file");
                return Record::new(name, Status::Error)
                    .with_meta("path", source)
                    .with_meta("reason", format!("decompression failed: {}", e));
            }
        }
    } else {
        let mut args: Vec<&str> = SA_ARGS.to_vec();
        args.push(&source);
        runner.run_args(SA_PROGRAM, &args).await
    };

    // sa exits 0 on files it cannot parse, complaining on stderr
    if output.status == Status::Ok && !output.stderr.is_empty() {
        output.status = Status::Error;
        output.reason = Some("sa decoding error".to_string());
    }

    let record = output.into_record(name, user);
    match file_info(path) {
        Ok(info) => record.with_meta("fileinfo", Value::Object(info.into_iter().collect())),
        Err(_) => record,
    }
}

/// Decode every accounting file and emit one record per file.
pub async fn collect(
    runner: &CommandRunner,
    skipped: bool,
    user: &str,
    emit: &mut dyn RecordEmitter,
) -> Result<()> {
    let dirs: Vec<PathBuf> = ACCOUNTING_DIRS.iter().map(PathBuf::from).collect();
    let files = accounting_files(&dirs);
    info!(files = files.len(), "Collecting process accounting");

    for path in files {
        let record = if skipped {
            CommandOutput::skipped(SA_PROGRAM, "skipped on request").into_record(record_name(&path), user)
        } else {
            accounting_record(runner, &path, user).await
        };
        emit.emit(record).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_accounting_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("pacct"), b"").unwrap();
        fs::write(dir.path().join("pacct-20240101.gz"), b"").unwrap();
        fs::write(dir.path().join("pacct-old.tbz2"), b"").unwrap();

        let files = accounting_files(&[dir.path().to_path_buf(), dir.path().join("missing")]);
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["pacct", "pacct-20240101.gz"]);
    }

    #[test]
    fn test_record_name() {
        assert_eq!(record_name(Path::new("/var/account/pacct")), "cmd_root/sa-pacct.jsonp");
    }

    #[tokio::test]
    async fn test_gzip_goes_through_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pacct.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"accounting data").unwrap();
        fs::write(&path, encoder.finish().unwrap()).unwrap();

        assert_eq!(decompress(&path).unwrap(), b"accounting data");

        // whether or not sa is installed, the record carries the file info
        let runner = CommandRunner::new(Duration::from_secs(5));
        let record = accounting_record(&runner, &path, "root").await;
        assert_eq!(record.name(), "cmd_root/sa-pacct.gz.jsonp");
        assert!(record.metadata().contains_key("fileinfo"));
        assert_eq!(record.metadata()["command"], "sa -a -b -j -");
    }
}
