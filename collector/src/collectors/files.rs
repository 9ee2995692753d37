//! File capture and directory listings.

use chrono::{Local, TimeZone};
use model::{Metadata, Record, Status};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn local_time(secs: i64) -> String {
    Local
        .timestamp_opt(secs, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default()
}

fn user_name(uid: u32) -> String {
    users::get_user_by_uid(uid)
        .map(|u| u.name().to_string_lossy().into_owned())
        .unwrap_or_else(|| uid.to_string())
}

fn group_name(gid: u32) -> String {
    users::get_group_by_gid(gid)
        .map(|g| g.name().to_string_lossy().into_owned())
        .unwrap_or_else(|| gid.to_string())
}

/// Stat information recorded alongside captured files.
pub fn file_info(path: &Path) -> std::io::Result<Metadata> {
    let meta = fs::metadata(path)?;
    let mut info = Metadata::new();
    info.insert("path".into(), path.display().to_string().into());
    info.insert(
        "dirname".into(),
        path.parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
            .into(),
    );
    info.insert(
        "basename".into(),
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
            .into(),
    );
    info.insert("size".into(), meta.size().into());
    info.insert("mode".into(), format!("{:o}", meta.mode() & 0o7777).into());
    info.insert("uid".into(), meta.uid().into());
    info.insert("gid".into(), meta.gid().into());
    info.insert("user".into(), user_name(meta.uid()).into());
    info.insert("group".into(), group_name(meta.gid()).into());
    info.insert("hardlinks".into(), meta.nlink().into());
    info.insert("atime".into(), local_time(meta.atime()).into());
    info.insert("mtime".into(), local_time(meta.mtime()).into());
    Ok(info)
}

/// Capture a text file as a record named `<path>.jsonp`.
pub fn file_record(path: &Path) -> Record {
    let name = format!("{}.jsonp", path.display());
    if !path.exists() {
        return Record::new(name, Status::Nonexistent).with_meta("path", path.display().to_string());
    }

    let info = match file_info(path) {
        Ok(info) => info,
        Err(e) => {
            return Record::new(name, Status::Error)
                .with_meta("path", path.display().to_string())
                .with_meta("reason", e.to_string())
        }
    };
    match fs::read(path) {
        Ok(data) => Record::new(name, Status::Ok)
            .with_metadata(info)
            .with_payload(data),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Cannot read file");
            Record::new(name, Status::Error)
                .with_metadata(info)
                .with_meta("reason", e.to_string())
        }
    }
}

/// One file in a directory listing.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ListedFile {
    pub path: String,
    pub size: u64,
    pub mtime: String,
    pub user: String,
    pub group: String,
}

/// Contents of one listed directory.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DirectoryListing {
    pub directory: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exists: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<ListedFile>>,
}

/// List regular files in each directory, sorted by name.
pub fn directory_listing(dirs: &[PathBuf]) -> Vec<DirectoryListing> {
    dirs.iter()
        .map(|dir| {
            if !dir.is_dir() {
                return DirectoryListing {
                    directory: dir.display().to_string(),
                    exists: Some(false),
                    files: None,
                };
            }
            let files = regular_files(dir)
                .into_iter()
                .filter_map(|path| {
                    let meta = fs::metadata(&path).ok()?;
                    Some(ListedFile {
                        path: path.display().to_string(),
                        size: meta.size(),
                        mtime: local_time(meta.mtime()),
                        user: user_name(meta.uid()),
                        group: group_name(meta.gid()),
                    })
                })
                .collect();
            DirectoryListing {
                directory: dir.display().to_string(),
                exists: None,
                files: Some(files),
            }
        })
        .collect()
}

/// Regular files directly inside `dir`, sorted. Unreadable directories are empty.
pub fn regular_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect(),
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Cannot list directory");
            Vec::new()
        }
    };
    files.sort();
    files
}

/// Whether a file starts with `prefix`.
pub fn starts_with(path: &Path, prefix: &[u8]) -> bool {
    let mut head = vec![0u8; prefix.len()];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut head))
        .map(|_| head == prefix)
        .unwrap_or(false)
}

pub fn is_gzip(path: &Path) -> bool {
    starts_with(path, &GZIP_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        fs::write(&path, "127.0.0.1 localhost\n").unwrap();

        let record = file_record(&path);
        assert_eq!(record.status(), Status::Ok);
        assert_eq!(record.name(), format!("{}.jsonp", path.display()));
        assert_eq!(record.payload(), b"127.0.0.1 localhost\n");
        assert_eq!(record.metadata()["basename"], "hosts");
        assert_eq!(record.metadata()["size"], 20);
    }

    #[test]
    fn test_missing_file() {
        let record = file_record(Path::new("/nonexistent/dbcollect/file"));
        assert_eq!(record.status(), Status::Nonexistent);
        assert!(record.payload().is_empty());
    }

    #[test]
    fn test_directory_listing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sa01"), b"x").unwrap();
        fs::write(dir.path().join("sa02"), b"yy").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let missing = dir.path().join("missing");

        let listing = directory_listing(&[dir.path().to_path_buf(), missing]);
        let files = listing[0].files.as_ref().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].size, 2);
        assert_eq!(listing[1].exists, Some(false));

        let json = serde_json::to_value(&listing[1]).unwrap();
        assert!(json.get("files").is_none());
    }

    #[test]
    fn test_magic() {
        let dir = tempfile::tempdir().unwrap();
        let gz = dir.path().join("pacct.gz");
        fs::write(&gz, [0x1f, 0x8b, 0x08, 0x00]).unwrap();
        let plain = dir.path().join("nmon");
        fs::write(&plain, "AAA,progname,topas_nmon\n").unwrap();

        assert!(is_gzip(&gz));
        assert!(!is_gzip(&plain));
        assert!(starts_with(&plain, b"AAA,progname"));
        assert!(!starts_with(&dir.path().join("none"), b"AAA"));
    }
}
