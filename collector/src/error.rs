//! Error types for the collection pipeline.

use model::ExitCode;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for collection operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while collecting.
#[derive(Error, Debug)]
pub enum Error {
    /// Target user does not exist
    #[error("User '{0}' does not exist")]
    NoSuchUser(String),

    /// Resolved identity is not acceptable as a drop target
    #[error("Cannot switch to {user}: {reason}")]
    InvalidTarget { user: String, reason: String },

    /// Changing identity failed
    #[error("Failed to drop privileges to {user}: {reason}")]
    DropFailed { user: String, reason: String },

    /// A bundled resource is not readable under the current identity
    #[error("Cannot access {path} as {user}: {reason}")]
    ResourceAccess {
        path: PathBuf,
        user: String,
        reason: String,
    },

    /// The archive could not be created
    #[error("Cannot create {path}: {reason}")]
    CannotCreate { path: PathBuf, reason: String },

    /// A file meant for the archive could not be read
    #[error("Cannot read {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    /// An entry with this name was already written
    #[error("Duplicate archive entry: {0}")]
    DuplicateEntry(String),

    /// No room in the channel within the timeout
    #[error("Channel full after {0:?}")]
    ChannelFull(Duration),

    /// Nothing arrived on the channel within the timeout
    #[error("Channel empty after {0:?}")]
    ChannelEmpty(Duration),

    /// The other end of the channel is gone
    #[error("Channel closed by peer")]
    ChannelClosed,

    /// Unexpected frame or misuse of the channel
    #[error("Channel protocol error: {0}")]
    Protocol(String),

    /// Program could not be started
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// Interactive session did not answer in time
    #[error("Session timed out after {0:?}")]
    SessionTimeout(Duration),

    /// Interactive session ended before answering
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Exit status of a worker that stops because of this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Error::NoSuchUser(_) | Error::InvalidTarget { .. } => ExitCode::IdentityUnavailable,
            Error::DropFailed { .. }
            | Error::ResourceAccess { .. }
            | Error::CannotCreate { .. }
            | Error::Config(_) => ExitCode::SetupFailed,
            Error::ChannelFull(_) | Error::ChannelClosed => ExitCode::ChannelFull,
            Error::Io(_) => ExitCode::CollectFailed,
            _ => ExitCode::Bug,
        }
    }

    /// Whether the error means the channel can no longer be used.
    pub fn is_channel_fault(&self) -> bool {
        matches!(self, Error::ChannelFull(_) | Error::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            Error::NoSuchUser("oracle".into()).exit_code(),
            ExitCode::IdentityUnavailable
        );
        assert_eq!(
            Error::DropFailed {
                user: "oracle".into(),
                reason: "EPERM".into()
            }
            .exit_code(),
            ExitCode::SetupFailed
        );
        assert_eq!(
            Error::ChannelFull(Duration::from_secs(1)).exit_code(),
            ExitCode::ChannelFull
        );
        assert_eq!(Error::Protocol("x".into()).exit_code(), ExitCode::Bug);
    }
}
