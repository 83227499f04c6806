//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytesize::ByteSize;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use kvfs::cache::{CachingPolicy, EvictOnLastClose, HoldClosedCacheFor, StoreOptions};
use kvfs::fs::MountOptions;
use kvfs::indexing::{FullPathIndexing, IndexingScheme, IndirectIndexing};

fn kvfs_data_dir() -> Option<PathBuf> {
    if let Some(path) = dirs::data_dir() {
        return Some(path.join("kvfs"));
    }

    dirs::home_dir().map(|path| path.join(".local").join("share").join("kvfs"))
}

fn default_backend_path() -> PathBuf {
    kvfs_data_dir().map_or_else(|| PathBuf::from("/tmp/kvfs/store"), |dir| dir.join("store"))
}

fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

fn default_flush_interval_ms() -> u64 {
    5000
}

fn default_flush_escalation_threshold() -> u32 {
    5
}

fn default_stripe_size() -> ByteSize {
    ByteSize::kib(64)
}

/// Where objects are stored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackendConfig {
    /// Directory holding one file per key.
    #[serde(default = "default_backend_path")]
    pub path: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            path: default_backend_path(),
        }
    }
}

/// How paths map to keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexingConfig {
    /// The key is the path itself.
    FullPath,
    /// The key is a random identifier kept in the parent directory.
    #[default]
    Indirect,
}

impl IndexingConfig {
    fn build(self) -> Box<dyn IndexingScheme> {
        match self {
            Self::FullPath => Box::new(FullPathIndexing),
            Self::Indirect => Box::new(IndirectIndexing),
        }
    }
}

/// How long closed objects stay cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachingConfig {
    /// Drop an object as soon as its last handle closes.
    #[default]
    EvictOnLastClose,
    /// Keep closed objects for this many milliseconds.
    HoldClosedForMs(u64),
}

impl CachingConfig {
    fn build(self) -> Box<dyn CachingPolicy> {
        match self {
            Self::EvictOnLastClose => Box::new(EvictOnLastClose),
            Self::HoldClosedForMs(ms) => Box::new(HoldClosedCacheFor::new(Duration::from_millis(ms))),
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub indexing: IndexingConfig,

    #[serde(default)]
    pub caching: CachingConfig,

    /// Milliseconds between background flush cycles.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Contended flush cycles tolerated before one blocks on its locks.
    #[serde(default = "default_flush_escalation_threshold")]
    pub flush_escalation_threshold: u32,

    /// Size of one data stripe.
    #[serde(default = "default_stripe_size")]
    pub stripe_size: ByteSize,

    /// The owner of created files. If not specified, the current user.
    #[serde(default = "current_uid")]
    pub uid: u32,

    /// The group of created files. If not specified, the current group.
    #[serde(default = "current_gid")]
    pub gid: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            indexing: IndexingConfig::default(),
            caching: CachingConfig::default(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_escalation_threshold: default_flush_escalation_threshold(),
            stripe_size: default_stripe_size(),
            uid: current_uid(),
            gid: current_gid(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let stripe = self.stripe_size.as_u64();
        if stripe == 0 {
            errors.push("Stripe size must be non-zero.".to_owned());
        } else if stripe > ByteSize::gib(4).as_u64() {
            errors.push(format!("Stripe size {} exceeds 4 GiB.", self.stripe_size));
        }

        if self.flush_interval_ms == 0 {
            errors.push("Flush interval must be non-zero.".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("kvfs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("kvfs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/kvfs/config.toml"));

        paths
    }

    /// Finds the first existing config file from search paths.
    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Loads the external path if given, else the first config file found, else the defaults.
    /// Errors if a config file exists but is malformed or invalid.
    pub fn load_or_default(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let found = external_config_path
            .map(Path::to_path_buf)
            .or_else(Self::find_config_file);
        let config = match found {
            Some(path) => Self::load_from_file(&path)?,
            None => {
                debug!("No configuration file found, using defaults.");
                Self::default()
            }
        };
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }

    /// Translates the configuration into library mount options.
    pub fn mount_options(&self) -> MountOptions {
        MountOptions {
            store: StoreOptions {
                indexing: self.indexing.build(),
                policy: self.caching.build(),
                stripe_size: self.stripe_size.as_u64(),
            },
            flush_interval: Some(Duration::from_millis(self.flush_interval_ms)),
            escalation_threshold: self.flush_escalation_threshold,
            owner: self.uid,
            group: self.gid,
        }
    }
}
