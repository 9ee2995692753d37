//! Configuration loading utilities
//!
//! Reads the optional dbcollect configuration file. The file is TOML with a
//! `[timeouts]` table and one table per platform that is merged over the
//! built-in catalogs:
//!
//! ```toml
//! [timeouts]
//! receive = 300
//!
//! [linux.commands]
//! numactl = "numactl --hardware"
//!
//! [linux]
//! files = ["/etc/multipath.conf"]
//! ```

use crate::{Catalog, Catalogs, ConfigError, Platform, Result, Timeouts};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Contents of a configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Timeout overrides
    pub timeouts: Timeouts,
    /// Catalog overlays keyed by platform
    #[serde(flatten)]
    pub platforms: BTreeMap<String, Catalog>,
}

/// Effective configuration after loading.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedConfig {
    pub timeouts: Timeouts,
    pub catalogs: Catalogs,
}

impl Default for LoadedConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            catalogs: Catalogs::builtin(),
        }
    }
}

/// Configuration loader
pub struct ConfigLoader {
    /// Path of the configuration file
    path: PathBuf,
    /// Whether to use default values when the file is missing
    use_defaults: bool,
    /// Whether to validate configuration after loading
    validate: bool,
}

impl ConfigLoader {
    /// Create a loader for the given file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            use_defaults: true,
            validate: true,
        }
    }

    /// Create a loader for the default system configuration
    pub fn system() -> Self {
        Self::new(paths::config_file())
    }

    /// Set whether to use defaults when the file is missing
    pub fn use_defaults(mut self, use_defaults: bool) -> Self {
        self.use_defaults = use_defaults;
        self
    }

    /// Set whether to validate configuration
    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Load the configuration
    pub fn load(&self) -> Result<LoadedConfig> {
        if !self.path.exists() {
            if self.use_defaults {
                tracing::debug!(path = %self.path.display(), "No configuration file, using defaults");
                return Ok(LoadedConfig::default());
            }
            return Err(ConfigError::NotFound(self.path.clone()));
        }

        let text = std::fs::read_to_string(&self.path)?;
        let file: ConfigFile = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let mut config = LoadedConfig::default();
        merge_config(&mut config, &file);

        if self.validate {
            validate_config(&config)?;
        }

        tracing::debug!(path = %self.path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Get the configuration file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Validate configuration for common issues
fn validate_config(config: &LoadedConfig) -> Result<()> {
    config.timeouts.validate()?;

    for platform in config.catalogs.platforms() {
        let catalog = config.catalogs.for_platform(platform);
        for (tag, cmd) in catalog.commands.iter().chain(catalog.root_commands.iter()) {
            if cmd.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Command '{}' for {} is empty",
                    tag, platform
                )));
            }
            if tag.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "Command tag '{}' for {} must not contain '/'",
                    tag, platform
                )));
            }
        }
        for file in &catalog.files {
            if !file.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "File '{}' for {} is not an absolute path",
                    file, platform
                )));
            }
        }
    }

    Ok(())
}

/// Merge a configuration file over the defaults
fn merge_config(base: &mut LoadedConfig, file: &ConfigFile) {
    base.timeouts = file.timeouts;

    for (key, overlay) in &file.platforms {
        let platform = match key.as_str() {
            "linux" => Platform::Linux,
            "aix" => Platform::Aix,
            "sunos" => Platform::SunOs,
            "hpux" => Platform::HpUx,
            other => {
                tracing::warn!(platform = %other, "Ignoring catalog for unsupported platform");
                continue;
            }
        };
        base.catalogs.merge(platform, overlay);
    }
}

/// Default paths
pub mod paths {
    use std::path::PathBuf;

    /// System configuration directory
    pub fn system_config() -> PathBuf {
        PathBuf::from("/etc/dbcollect")
    }

    /// Default configuration file
    pub fn config_file() -> PathBuf {
        system_config().join("dbcollect.toml")
    }

    /// Oracle instance table
    pub fn oratab() -> PathBuf {
        PathBuf::from("/etc/oratab")
    }

    /// External timeout wrapper used for database sessions
    pub fn timeout_wrapper() -> PathBuf {
        PathBuf::from("/usr/bin/timeout")
    }
}
