//! Configuration management for treewatch
//!
//! This module provides configuration structures and defaults for the watch
//! registry (rename correlation, event reading) and for recursive installs.

use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::EventMask;

/// Global configuration for treewatch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TreewatchConfig {
    /// Event router configuration
    pub router: RouterConfig,
    /// Recursive install configuration
    pub install: InstallConfig,
}

/// Configuration for the event router
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// How long a move-out waits for its matching move-in, in milliseconds
    pub rename_retention_ms: u64,
    /// Maximum number of unmatched move-outs held at once
    pub max_pending_renames: usize,
    /// Size of the buffer used for each low-level read
    pub read_buffer_bytes: usize,
}

/// Configuration for recursive installation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Skip subdirectories excluded by .gitignore / .ignore files
    pub honor_ignore_files: bool,
    /// Event names watched when the caller does not pick any
    pub default_events: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            rename_retention_ms: 500,
            max_pending_renames: 1024,
            read_buffer_bytes: 64 * 1024,
        }
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            honor_ignore_files: false,
            default_events: vec!["all".to_string()],
        }
    }
}

impl RouterConfig {
    /// Get rename retention window
    pub fn rename_retention(&self) -> Duration {
        Duration::from_millis(self.rename_retention_ms)
    }
}

impl InstallConfig {
    /// Mask built from `default_events`
    pub fn default_mask(&self) -> Result<EventMask, String> {
        EventMask::from_names(&self.default_events)
    }
}

/// Configuration loading and management
impl TreewatchConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path` if given, then apply environment overrides
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        Ok(config.with_env_overrides())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("TREEWATCH_RENAME_RETENTION_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.router.rename_retention_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("TREEWATCH_MAX_PENDING_RENAMES") {
            if let Ok(max) = val.parse::<usize>() {
                self.router.max_pending_renames = max;
            }
        }

        if let Ok(val) = std::env::var("TREEWATCH_READ_BUFFER_BYTES") {
            if let Ok(bytes) = val.parse::<usize>() {
                self.router.read_buffer_bytes = bytes;
            }
        }

        if let Ok(val) = std::env::var("TREEWATCH_HONOR_IGNORE_FILES") {
            if let Ok(flag) = val.parse::<bool>() {
                self.install.honor_ignore_files = flag;
            }
        }

        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.router.rename_retention_ms == 0 {
            return Err("rename_retention_ms must be greater than 0".to_string());
        }

        if self.router.max_pending_renames == 0 {
            return Err("max_pending_renames must be greater than 0".to_string());
        }

        if self.router.read_buffer_bytes < 256 {
            return Err("read_buffer_bytes must be at least 256".to_string());
        }

        self.install.default_mask()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TreewatchConfig::default();

        assert_eq!(config.router.rename_retention_ms, 500);
        assert_eq!(config.router.max_pending_renames, 1024);
        assert!(!config.install.honor_ignore_files);
        assert_eq!(config.install.default_mask().unwrap(), EventMask::ALL_EVENTS);
    }

    #[test]
    fn test_config_validation() {
        let mut config = TreewatchConfig::default();
        assert!(config.validate().is_ok());

        config.router.max_pending_renames = 0;
        assert!(config.validate().is_err());

        config.router.max_pending_renames = 16;
        config.install.default_events = vec!["nonsense".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_conversions() {
        let config = RouterConfig::default();

        assert_eq!(config.rename_retention(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_toml() {
        let config: TreewatchConfig = toml::from_str(
            "[router]\nrename_retention_ms = 50\n\n[install]\nhonor_ignore_files = true\n",
        )
        .unwrap();

        assert_eq!(config.router.rename_retention_ms, 50);
        assert_eq!(config.router.max_pending_renames, 1024);
        assert!(config.install.honor_ignore_files);
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("treewatch.toml");
        std::fs::write(&path, "[install]\ndefault_events = [\"create\", \"delete\"]\n").unwrap();

        let config = TreewatchConfig::load(&path).unwrap();
        assert_eq!(
            config.install.default_mask().unwrap(),
            EventMask::CREATE | EventMask::DELETE
        );
        assert!(TreewatchConfig::load(temp_dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_env_config_loading() {
        std::env::set_var("TREEWATCH_MAX_PENDING_RENAMES", "7");

        let config = TreewatchConfig::from_env();

        assert_eq!(config.router.max_pending_renames, 7);

        // Cleanup
        std::env::remove_var("TREEWATCH_MAX_PENDING_RENAMES");
    }
}
