//! The run-scoped log file.
//!
//! Created by the orchestrator while it may still be root, handed to the
//! target user so the collection worker can read it back, and removed when
//! the guard goes out of scope. The file is created exclusively and all
//! later changes go through its descriptor, so nothing planted at the path
//! is ever followed.

use anyhow::{Context, Result};
use model::Identity;
use nix::fcntl::OFlag;
use nix::unistd::{fchown, Gid, Uid};
use std::fs::{self, File, OpenOptions, Permissions};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

const RUN_LOG_MODE: u32 = 0o644;

/// Owns `<tempdir>/dbcollect-<pid>.log` for the lifetime of the run.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: File,
}

impl RunLog {
    /// Create the log file and return the guard with an append handle.
    ///
    /// Fails if anything already exists at the path.
    pub fn create(tempdir: &Path) -> Result<(Self, File)> {
        let path = tempdir.join(format!("dbcollect-{}.log", std::process::id()));
        let file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .custom_flags(OFlag::O_NOFOLLOW.bits())
            .mode(RUN_LOG_MODE)
            .open(&path)
            .with_context(|| format!("Failed to create run log {}", path.display()))?;
        // umask may have narrowed the mode
        file.set_permissions(Permissions::from_mode(RUN_LOG_MODE))
            .with_context(|| format!("Failed to set mode on {}", path.display()))?;
        let handle = file
            .try_clone()
            .with_context(|| format!("Failed to duplicate {}", path.display()))?;
        Ok((Self { path, file }, handle))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Give the file to the identity the collection worker runs as.
    pub fn hand_over(&self, target: &Identity) -> Result<()> {
        fchown(
            self.file.as_raw_fd(),
            Some(Uid::from_raw(target.uid)),
            Some(Gid::from_raw(target.gid)),
        )
        .with_context(|| format!("Failed to hand {} to {}", self.path.display(), target.username))?;
        debug!(path = %self.path.display(), user = %target.username, "Run log handed over");
        Ok(())
    }

    pub fn read(&self) -> Result<String> {
        fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read run log {}", self.path.display()))
    }
}

impl Drop for RunLog {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
