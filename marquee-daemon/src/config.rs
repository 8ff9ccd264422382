//! Configuration file loading and management
//!
//! This module handles loading and parsing the daemon configuration from
//! `$XDG_CONFIG_HOME/marquee/config.toml`. If the configuration file doesn't
//! exist, a default configuration is created with documented comments.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// One week.
pub const MAX_REFRESH_INTERVAL_MINUTES: u64 = 7 * 24 * 60;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Daemon-specific configuration
    pub daemon: DaemonConfig,
    /// Extension discovery and execution settings
    #[serde(default)]
    pub extensions: ExtensionsConfig,
    /// Lifecycle state persistence
    #[serde(default)]
    pub state: StateConfig,
}

/// Daemon server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    /// Bind address for the JSON-RPC server
    /// Default: "127.0.0.1:3040"
    pub bind_address: String,
    /// Log level (trace, debug, info, warn, error)
    /// Default: "info"
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtensionsConfig {
    /// Package directories scanned in addition to the user and system ones
    pub directories: Vec<PathBuf>,
    /// Minutes between discovery passes
    pub refresh_interval_minutes: u64,
    /// Per-call timeout in milliseconds
    pub call_timeout_ms: u64,
    /// Maximum number of extensions queried at once
    pub max_fan_out: usize,
    /// Directories native artifacts must live under. Empty means only the
    /// package directory itself is enforced.
    pub allowed_roots: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateConfig {
    /// Path to the state database (SQLite)
    /// If None, uses XDG_DATA_HOME/marquee/state.db
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:3040".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            refresh_interval_minutes: 30,
            call_timeout_ms: 10_000,
            max_fan_out: 8,
            allowed_roots: Vec::new(),
        }
    }
}

impl ExtensionsConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Capped at [`MAX_REFRESH_INTERVAL_MINUTES`] for configs that skipped
    /// validation.
    pub fn refresh_interval(&self) -> Duration {
        let minutes = self
            .refresh_interval_minutes
            .min(MAX_REFRESH_INTERVAL_MINUTES);
        Duration::from_secs(minutes * 60)
    }
}

impl Config {
    /// Load configuration from the specified path
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    /// The parsed configuration or an error if loading/parsing fails
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default XDG config location
    ///
    /// If the configuration file doesn't exist, creates a default configuration
    /// file with documented comments.
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_file(&config_path)?;
        }

        Self::load(&config_path)
    }

    /// Returns `$XDG_CONFIG_HOME/marquee/config.toml`
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = project_dirs()?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    fn create_default_file(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, Self::default_config_content())
            .with_context(|| format!("Failed to write default config file: {}", path.display()))?;

        tracing::info!("Created default configuration file at: {}", path.display());
        Ok(())
    }

    /// Generate the default configuration file content with comments
    pub fn default_config_content() -> String {
        r#"# Marquee Daemon Configuration
# This file configures the marquee-daemon behavior.

[daemon]
# Bind address for the JSON-RPC API server
# Default: "127.0.0.1:3040"
bind_address = "127.0.0.1:3040"

# Log level: trace, debug, info, warn, error
# Default: "info"
# RUST_LOG overrides this when set.
log_level = "info"

[extensions]
# Extra package directories to scan, in addition to
# $XDG_DATA_HOME/marquee/extensions and the system data directories.
directories = []

# How often to rescan package directories, in minutes (1 to 10080)
# Default: 30
refresh_interval_minutes = 30

# How long a single extension call may run, in milliseconds
# Default: 10000
call_timeout_ms = 10000

# How many extensions are queried at once
# Default: 8
max_fan_out = 8

# Native libraries must resolve under one of these directories.
# Empty means only the package directory itself is enforced.
allowed_roots = []

[state]
# Path to the SQLite database holding enabled flags and install order
# If not specified, defaults to $XDG_DATA_HOME/marquee/state.db
# path = "/path/to/state.db"
"#
        .to_string()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.daemon
            .bind_address
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid bind_address: {}", self.daemon.bind_address))?;

        if !VALID_LOG_LEVELS.contains(&self.daemon.log_level.as_str()) {
            anyhow::bail!(
                "Invalid log_level: {}. Must be one of: {}",
                self.daemon.log_level,
                VALID_LOG_LEVELS.join(", ")
            );
        }

        if self.extensions.refresh_interval_minutes == 0 {
            anyhow::bail!("extensions.refresh_interval_minutes must be greater than 0");
        }
        if self.extensions.refresh_interval_minutes > MAX_REFRESH_INTERVAL_MINUTES {
            anyhow::bail!(
                "extensions.refresh_interval_minutes must be at most {}",
                MAX_REFRESH_INTERVAL_MINUTES
            );
        }
        if self.extensions.call_timeout_ms == 0 {
            anyhow::bail!("extensions.call_timeout_ms must be greater than 0");
        }
        if self.extensions.max_fan_out == 0 {
            anyhow::bail!("extensions.max_fan_out must be greater than 0");
        }

        Ok(())
    }

    /// Returns the configured state path or the default XDG data directory path
    pub fn state_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.state.path {
            return Ok(path.clone());
        }

        let dirs = project_dirs()?;
        Ok(dirs.data_dir().join("state.db"))
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "marquee-app", "marquee")
        .context("Failed to determine project directories")
}
