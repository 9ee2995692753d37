//! The bundle: a gzip compressed tar archive with one writer.
//!
//! Entry names are prefixed with the host name so bundles from several hosts
//! can be unpacked side by side. A name can be written only once.

use crate::error::{Error, Result};
use crate::workers::RecordEmitter;
use async_trait::async_trait;
use chrono::Local;
use flate2::write::GzEncoder;
use flate2::Compression;
use model::Record;
use nix::fcntl::OFlag;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the trailing run log entry.
pub const LOG_ENTRY: &str = "dbcollect.log";

/// Bundle file name prefix.
pub const BUNDLE_PREFIX: &str = "dbcollect-";

/// Bundle file name suffix.
pub const BUNDLE_SUFFIX: &str = ".tar.gz";

/// Default bundle path for a host.
pub fn default_filename(tempdir: &Path, hostname: &str) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M");
    tempdir.join(format!("{}{}-{}{}", BUNDLE_PREFIX, hostname, stamp, BUNDLE_SUFFIX))
}

/// Bundle path for an operator supplied name, adding the suffix if missing.
pub fn bundle_filename(name: &Path) -> PathBuf {
    let text = name.display().to_string();
    if text.ends_with(BUNDLE_SUFFIX) {
        name.to_path_buf()
    } else {
        PathBuf::from(format!("{}{}", text, BUNDLE_SUFFIX))
    }
}

/// Append-only archive writer.
pub struct Sink {
    path: PathBuf,
    prefix: String,
    builder: tar::Builder<GzEncoder<File>>,
    names: HashSet<String>,
}

impl Sink {
    /// Create the archive at `path`, replacing an existing file.
    ///
    /// The old name is unlinked and a new file created exclusively, so a
    /// planted symlink is never followed.
    pub fn open(path: impl AsRef<Path>, hostname: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cannot_create = |e: std::io::Error| Error::CannotCreate {
            path: path.clone(),
            reason: crate::runner::describe_io_error(&e),
        };
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Replacing existing archive"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(cannot_create(e)),
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .custom_flags(OFlag::O_NOFOLLOW.bits())
            .mode(0o644)
            .open(&path)
            .map_err(cannot_create)?;

        let builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

        info!(path = %path.display(), "Created archive");
        Ok(Self {
            path,
            prefix: hostname.to_string(),
            builder,
            names: HashSet::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries written so far.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Whether `name` was already written.
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(&normalize(name))
    }

    /// Write one entry.
    pub fn write_entry(&mut self, name: &str, data: &[u8]) -> Result<()> {
        self.append(name, data, 0o644, Local::now().timestamp().max(0) as u64)
    }

    /// Write a record under its own name.
    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        self.write_entry(record.name(), &record.to_jsonp())
    }

    /// Write a value as pretty printed JSON.
    pub fn write_json<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)?;
        self.write_entry(name, &data)
    }

    /// Copy a file verbatim, named after its absolute path.
    ///
    /// A file that cannot be read fails with [`Error::Unreadable`] and leaves
    /// the archive untouched.
    pub fn store_file(&mut self, path: &Path) -> Result<()> {
        let unreadable = |e: std::io::Error| Error::Unreadable {
            path: path.to_path_buf(),
            reason: crate::runner::describe_io_error(&e),
        };
        let mut file = File::open(path).map_err(unreadable)?;
        let meta = file.metadata().map_err(unreadable)?;
        let mut data = Vec::with_capacity(meta.len() as usize);
        file.read_to_end(&mut data).map_err(unreadable)?;
        self.append(
            &path.display().to_string(),
            &data,
            meta.mode() & 0o7777,
            meta.mtime().max(0) as u64,
        )
    }

    fn append(&mut self, name: &str, data: &[u8], mode: u32, mtime: u64) -> Result<()> {
        let name = normalize(name);
        if name.is_empty() {
            return Err(Error::Protocol("empty archive entry name".to_string()));
        }
        if self.names.contains(&name) {
            warn!(name = %name, "Refusing to write duplicate archive entry");
            return Err(Error::DuplicateEntry(name));
        }

        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(mode);
        header.set_mtime(mtime);
        header.set_entry_type(tar::EntryType::Regular);

        let full = format!("{}/{}", self.prefix, name);
        self.builder.append_data(&mut header, &full, data)?;
        debug!(name = %name, bytes = data.len(), "Wrote archive entry");
        self.names.insert(name);
        Ok(())
    }

    /// Finish the archive and return its path.
    pub fn close(self) -> Result<PathBuf> {
        let encoder = self.builder.into_inner()?;
        let mut file = encoder.finish()?;
        file.flush()?;
        file.sync_all()?;
        info!(path = %self.path.display(), entries = self.names.len(), "Closed archive");
        Ok(self.path)
    }
}

/// Records are written as they arrive; a refused duplicate is not an error.
#[async_trait]
impl RecordEmitter for Sink {
    async fn emit(&mut self, record: Record) -> Result<()> {
        match self.write_record(&record) {
            Err(Error::DuplicateEntry(_)) => Ok(()),
            other => other,
        }
    }
}

/// Strip leading slashes and empty or `.` components.
fn normalize(name: &str) -> String {
    name.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use model::Status;
    use std::io::Read;

    fn entries(path: &Path) -> Vec<(String, Vec<u8>)> {
        let file = File::open(path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().display().to_string();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (name, data)
            })
            .collect()
    }

    #[test]
    fn test_entries_are_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = Sink::open(dir.path().join("bundle.tar.gz"), "db01").unwrap();
        sink.write_entry("meta.json", b"{}").unwrap();
        sink.write_record(&Record::new("cmd/uname.jsonp", Status::Ok).with_payload("Linux"))
            .unwrap();
        let path = sink.close().unwrap();

        let entries = entries(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("db01/meta.json".to_string(), b"{}".to_vec()));
        assert_eq!(entries[1].0, "db01/cmd/uname.jsonp");
        assert!(entries[1].1.ends_with(b"\nLinux"));
    }

    #[test]
    fn test_duplicate_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = Sink::open(dir.path().join("bundle.tar.gz"), "db01").unwrap();
        sink.write_entry("etc/hosts.jsonp", b"one").unwrap();
        assert!(matches!(
            sink.write_entry("/etc/hosts.jsonp", b"two"),
            Err(Error::DuplicateEntry(_))
        ));
        assert!(sink.contains("etc/hosts.jsonp"));
        let path = sink.close().unwrap();
        assert_eq!(entries(&path), vec![("db01/etc/hosts.jsonp".to_string(), b"one".to_vec())]);
    }

    #[test]
    fn test_store_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("sa01");
        std::fs::write(&source, [0u8, 1, 2, 3]).unwrap();

        let mut sink = Sink::open(dir.path().join("bundle.tar.gz"), "h").unwrap();
        sink.store_file(&source).unwrap();
        let path = sink.close().unwrap();

        let entries = entries(&path);
        let expected = format!("h/{}", normalize(&source.display().to_string()));
        assert_eq!(entries, vec![(expected, vec![0u8, 1, 2, 3])]);
    }

    #[test]
    fn test_store_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = Sink::open(dir.path().join("bundle.tar.gz"), "h").unwrap();
        assert!(matches!(
            sink.store_file(&dir.path().join("missing")),
            Err(Error::Unreadable { .. })
        ));
        // a directory opens but cannot be read
        assert!(matches!(sink.store_file(dir.path()), Err(Error::Unreadable { .. })));
        assert!(sink.is_empty());
        sink.write_entry("after.json", b"{}").unwrap();
        let path = sink.close().unwrap();
        assert_eq!(entries(&path).len(), 1);
    }

    #[test]
    fn test_open_replaces_symlink_without_following_it() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim");
        std::fs::write(&victim, b"keep me").unwrap();
        let bundle = dir.path().join("bundle.tar.gz");
        std::os::unix::fs::symlink(&victim, &bundle).unwrap();

        let sink = Sink::open(&bundle, "h").unwrap();
        sink.close().unwrap();

        assert_eq!(std::fs::read(&victim).unwrap(), b"keep me");
        assert!(!std::fs::symlink_metadata(&bundle).unwrap().file_type().is_symlink());
    }

    #[test]
    fn test_open_replaces_existing_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("bundle.tar.gz");
        std::fs::write(&bundle, b"old").unwrap();
        let mut sink = Sink::open(&bundle, "h").unwrap();
        sink.write_entry("meta.json", b"{}").unwrap();
        let path = sink.close().unwrap();
        assert_eq!(entries(&path).len(), 1);
    }

    #[test]
    fn test_cannot_create() {
        let result = Sink::open("/nonexistent/dir/bundle.tar.gz", "h");
        assert!(matches!(result, Err(Error::CannotCreate { .. })));
    }

    #[test]
    fn test_filenames() {
        let path = default_filename(Path::new("/tmp"), "db01");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("dbcollect-db01-"));
        assert!(name.ends_with(".tar.gz"));

        assert_eq!(bundle_filename(Path::new("/tmp/x")), PathBuf::from("/tmp/x.tar.gz"));
        assert_eq!(bundle_filename(Path::new("/tmp/x.tar.gz")), PathBuf::from("/tmp/x.tar.gz"));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/etc//hosts"), "etc/hosts");
        assert_eq!(normalize("./cmd/df.jsonp"), "cmd/df.jsonp");
    }
}
