//! Configuration and preference storage.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::call::bandwidth::DeviceClass;

/// Application configuration.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signaling server base URL (ws:// or wss://).
    pub signaling_url: Option<String>,
    /// History/REST collaborator base URL.
    pub history_url: Option<String>,
    /// Display name announced on session join.
    pub display_name: Option<String>,
    /// Persisted low-bandwidth preference (user toggle).
    pub low_bandwidth: bool,
    /// Device class for capture-tier selection.
    pub device_class: DeviceClass,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: None,
            history_url: None,
            display_name: None,
            low_bandwidth: false,
            device_class: DeviceClass::Desktop,
        }
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "gatecall", "gatecall")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    pub fn signaling_url(&self) -> &str {
        self.signaling_url
            .as_deref()
            .unwrap_or("ws://localhost:8443")
    }

    pub fn history_url(&self) -> &str {
        self.history_url
            .as_deref()
            .unwrap_or("http://localhost:8443")
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or("gatecall user")
    }
}
