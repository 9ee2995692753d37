//! Run metadata, the first entry of every bundle.

use config::Platform;
use model::{timestamp, Identity, APPLICATION};
use serde::Serialize;

/// Name of the metadata entry.
pub const META_ENTRY: &str = "meta.json";

#[derive(Debug, Clone, Serialize)]
pub struct RunMeta {
    pub application: String,
    pub version: String,
    pub hostname: String,
    pub platform: String,
    pub cmdline: String,
    pub username: String,
    pub usergroup: String,
    pub usergroups: String,
    pub timestamp: String,
    /// Seconds since the epoch
    pub timestamp_utc: i64,
}

impl RunMeta {
    /// Metadata for a run on `hostname` collecting as `identity`.
    pub fn new(hostname: &str, platform: &Platform, identity: &Identity) -> Self {
        Self {
            application: APPLICATION.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname: hostname.to_string(),
            platform: platform.to_string(),
            cmdline: std::env::args().collect::<Vec<_>>().join(" "),
            username: identity.username.clone(),
            usergroup: identity.group.clone(),
            usergroups: identity.group_names(),
            timestamp: timestamp(),
            timestamp_utc: chrono::Utc::now().timestamp(),
        }
    }
}
