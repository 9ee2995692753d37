//! Target identity resolution and the one-way privilege drop.

use crate::error::{Error, Result};
use crate::instances::running_instances;
use model::{Group, Identity};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{self, Gid, Uid};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use users::os::unix::UserExt;

/// Preferred fallback owner when no instance is running.
pub const DATABASE_USER: &str = "oracle";

/// Last resort unprivileged identity.
pub const FALLBACK_USER: &str = "nobody";

/// File creation mask after the drop.
pub const DROP_UMASK: u32 = 0o022;

/// Working directory when the target has no usable home.
const FALLBACK_DIR: &str = "/tmp";

fn identity_from_user(user: &users::User) -> Identity {
    let gid = user.primary_group_id();
    let group = users::get_group_by_gid(gid)
        .map(|g| g.name().to_string_lossy().into_owned())
        .unwrap_or_else(|| gid.to_string());
    let groups = users::get_user_groups(user.name(), gid)
        .unwrap_or_default()
        .iter()
        .map(|g| Group::new(g.gid(), g.name().to_string_lossy()))
        .collect();

    Identity {
        uid: user.uid(),
        gid,
        username: user.name().to_string_lossy().into_owned(),
        group,
        groups,
        home: Some(user.home_dir().display().to_string()),
    }
}

/// Look up a user by name.
pub fn lookup_identity(name: &str) -> Result<Identity> {
    users::get_user_by_name(name)
        .map(|user| identity_from_user(&user))
        .ok_or_else(|| Error::NoSuchUser(name.to_string()))
}

/// Identity the process currently runs with.
pub fn current_identity() -> Identity {
    let uid = unistd::geteuid().as_raw();
    let gid = unistd::getegid().as_raw();
    match users::get_user_by_uid(uid) {
        Some(user) => {
            let mut identity = identity_from_user(&user);
            identity.gid = gid;
            identity
        }
        None => Identity {
            uid,
            gid,
            username: uid.to_string(),
            group: gid.to_string(),
            groups: vec![Group::new(gid, gid.to_string())],
            home: None,
        },
    }
}

/// Owner of the first running database instance, if any.
pub fn detect_instance_owner() -> Option<String> {
    running_instances().into_iter().find_map(|instance| {
        let uid = instance.uid.filter(|uid| *uid != 0)?;
        let user = users::get_user_by_uid(uid)?;
        debug!(sid = %instance.sid, uid = uid, "Found instance owner");
        Some(user.name().to_string_lossy().into_owned())
    })
}

/// Pick the identity the collection worker switches to.
///
/// Order: the explicit user; the owner of a running instance; the database
/// user if it exists; `nobody`. An explicit user that does not exist is an
/// error, never a reason to fall through. Superuser targets are rejected.
pub fn resolve_target_identity(explicit: Option<&str>) -> Result<Identity> {
    let identity = match explicit {
        Some(name) => lookup_identity(name)?,
        None => match detect_instance_owner() {
            Some(owner) => lookup_identity(&owner)?,
            None => lookup_identity(DATABASE_USER).or_else(|_| lookup_identity(FALLBACK_USER))?,
        },
    };

    if identity.is_privileged() {
        return Err(Error::InvalidTarget {
            user: identity.username,
            reason: "target must not be the superuser".to_string(),
        });
    }

    info!(target = %identity, "Resolved target user");
    Ok(identity)
}

/// Result of [`PrivilegeDropper::drop_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropOutcome {
    /// Identity was switched
    Dropped,
    /// Process was not privileged; nothing changed
    AlreadyUnprivileged,
}

/// Permanently switches a privileged process to an unprivileged identity.
#[derive(Debug, Clone, Default)]
pub struct PrivilegeDropper {
    required: Vec<PathBuf>,
}

impl PrivilegeDropper {
    pub fn new() -> Self {
        Self::default()
    }

    /// A path that must still be readable after the drop.
    pub fn require_readable(mut self, path: impl Into<PathBuf>) -> Self {
        self.required.push(path.into());
        self
    }

    /// Switch to `target`.
    ///
    /// Group, supplementary groups and user are set in that order; the group
    /// calls need the privilege the user switch gives up. Afterwards the
    /// umask is reset, regaining root is verified to fail and every required
    /// path is checked for readability.
    pub fn drop_to(&self, target: &Identity) -> Result<DropOutcome> {
        if !unistd::geteuid().is_root() {
            debug!(uid = unistd::geteuid().as_raw(), "Not privileged, keeping current identity");
            return Ok(DropOutcome::AlreadyUnprivileged);
        }

        if target.is_privileged() {
            return Err(Error::InvalidTarget {
                user: target.username.clone(),
                reason: "target must not be the superuser".to_string(),
            });
        }

        let failed = |step: &str, e: nix::Error| Error::DropFailed {
            user: target.username.clone(),
            reason: format!("{}: {}", step, e.desc()),
        };

        let gids: Vec<Gid> = target.group_ids().into_iter().map(Gid::from_raw).collect();
        unistd::setgid(Gid::from_raw(target.gid)).map_err(|e| failed("setgid", e))?;
        unistd::setgroups(&gids).map_err(|e| failed("setgroups", e))?;
        unistd::setuid(Uid::from_raw(target.uid)).map_err(|e| failed("setuid", e))?;
        umask(Mode::from_bits_truncate(DROP_UMASK));

        self.verify(target)?;

        let home = target
            .home
            .as_deref()
            .map(Path::new)
            .filter(|home| home.is_dir());
        let workdir = home.unwrap_or_else(|| Path::new(FALLBACK_DIR));
        if let Err(e) = unistd::chdir(workdir) {
            warn!(dir = %workdir.display(), error = %e, "Cannot change to working directory");
        }

        info!(user = %target, "Dropped privileges");
        Ok(DropOutcome::Dropped)
    }

    fn verify(&self, target: &Identity) -> Result<()> {
        let uid = unistd::getuid().as_raw();
        let euid = unistd::geteuid().as_raw();
        if uid != target.uid || euid != target.uid {
            return Err(Error::DropFailed {
                user: target.username.clone(),
                reason: format!("still running as uid={} euid={}", uid, euid),
            });
        }
        if unistd::setuid(Uid::from_raw(0)).is_ok() {
            return Err(Error::DropFailed {
                user: target.username.clone(),
                reason: "superuser could be regained".to_string(),
            });
        }

        for path in &self.required {
            check_readable(path).map_err(|e| Error::ResourceAccess {
                path: path.clone(),
                user: target.username.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

/// Open a file or list a directory to prove it is readable.
pub fn check_readable(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::read_dir(path).map(|_| ())
    } else {
        std::fs::File::open(path).map(|_| ())
    }
}
