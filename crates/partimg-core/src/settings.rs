//! Persistent user settings for partimg
//!
//! Settings are stored in a TOML configuration file at:
//! - Linux: `~/.config/partimg/partimg_config.toml`
//! - macOS: `~/Library/Application Support/partimg/partimg_config.toml`
//!
//! # Example Configuration
//!
//! ```toml
//! [engine]
//! rescue = false
//! check_size = true
//! check_free_space = true
//! raw_block_size = 4096
//!
//! [progress]
//! style = "bar"
//! limit = false
//!
//! [behavior]
//! quiet = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::bitmap::DEFAULT_RAW_BLOCK_SIZE;
use crate::config::EngineConfig;

/// Configuration file name
const CONFIG_FILE_NAME: &str = "partimg_config.toml";

/// Application name for config directory
const APP_NAME: &str = "partimg";

/// User settings loaded from configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Copy engine settings
    pub engine: EngineSettings,

    /// Progress display settings
    pub progress: ProgressSettings,

    /// Behavior settings
    pub behavior: BehaviorSettings,
}

/// Settings for the copy engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    /// Re-read failed blocks sector by sector instead of aborting
    pub rescue: bool,

    /// Refuse to write to a target smaller than the source device
    pub check_size: bool,

    /// Refuse to create an image that will not fit
    pub check_free_space: bool,

    /// Block size for raw imaging, in bytes
    pub raw_block_size: u32,
}

/// Settings for progress display
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProgressSettings {
    /// Sink to use (bar, plain, gauge, none)
    pub style: String,

    /// Render at most once per second
    pub limit: bool,
}

/// General behavior settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BehaviorSettings {
    /// Whether to suppress non-error output
    pub quiet: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let config = EngineConfig::default();
        Self {
            rescue: config.rescue,
            check_size: config.check_size,
            check_free_space: config.check_free_space,
            raw_block_size: DEFAULT_RAW_BLOCK_SIZE,
        }
    }
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            style: "bar".to_string(),
            limit: false,
        }
    }
}

impl EngineSettings {
    /// Engine configuration these settings describe
    pub fn to_config(&self) -> EngineConfig {
        EngineConfig::new()
            .rescue(self.rescue)
            .check_size(self.check_size)
            .check_free_space(self.check_free_space)
    }
}

impl Settings {
    /// Load settings from the configuration file
    ///
    /// Returns default settings if the file doesn't exist or can't be parsed
    pub fn load() -> Self {
        Self::load_from_path(Self::config_path())
    }

    /// Load settings from a specific path
    pub fn load_from_path(path: Option<PathBuf>) -> Self {
        let Some(path) = path else {
            tracing::debug!("No config path available, using defaults");
            return Self::default();
        };

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Self::default();
        }

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(settings) => {
                    tracing::debug!("Loaded settings from {:?}", path);
                    settings
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config file {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Save settings to the configuration file
    pub fn save(&self) -> Result<PathBuf, SettingsError> {
        self.save_to_path(Self::config_path())
    }

    /// Save settings to a specific path
    pub fn save_to_path(&self, path: Option<PathBuf>) -> Result<PathBuf, SettingsError> {
        let path = path.ok_or(SettingsError::NoConfigDir)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SettingsError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let contents = toml::to_string_pretty(self).map_err(SettingsError::Serialize)?;

        std::fs::write(&path, contents).map_err(|e| SettingsError::Io {
            path: path.clone(),
            source: e,
        })?;

        tracing::info!("Saved settings to {:?}", path);
        Ok(path)
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join(CONFIG_FILE_NAME))
    }

    /// Get the path to the configuration directory
    pub fn config_dir() -> Option<PathBuf> {
        dirs_next::config_dir().map(|p| p.join(APP_NAME))
    }

    /// Check if a configuration file exists
    pub fn config_exists() -> bool {
        Self::config_path().is_some_and(|p| p.exists())
    }

    /// Generate a default configuration file content as a string
    pub fn default_config_string() -> String {
        let default = Self::default();
        toml::to_string_pretty(&default)
            .unwrap_or_else(|_| String::from("# Failed to generate default config"))
    }
}

/// Errors that can occur when working with settings
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// No configuration directory available
    #[error("Could not determine configuration directory")]
    NoConfigDir,

    /// Failed to read or write config file
    #[error("I/O error for {path}: {source}")]
    Io {
        /// Path that caused the error
        path: PathBuf,
        /// The underlying error
        source: std::io::Error,
    },

    /// Failed to serialize settings
    #[error("Failed to serialize settings: {0}")]
    Serialize(toml::ser::Error),
}
