//! Configuration management for the gateway schema registry
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (gateway.toml)
//! - Environment variables (GATEWAY__*)
//!
//! ## Example config file (gateway.toml):
//! ```toml
//! [branch]
//! max_versions = 10
//! max_unused_seconds = 1800
//!
//! [registry]
//! sweep_interval_seconds = 60
//! inbox_warn_depth = 64
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RegistryError, Result};

/// Main configuration for the schema registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Per-branch settings
    #[serde(default)]
    pub branch: BranchConfig,

    /// Registry-wide settings
    #[serde(default)]
    pub registry: RegistrySettings,
}

/// Branch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchConfig {
    /// How many versions a branch keeps in its history
    #[serde(default = "default_max_versions")]
    pub max_versions: usize,

    /// How long a branch may stay without services before it is evicted
    #[serde(default = "default_max_unused_seconds")]
    pub max_unused_seconds: u64,
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Period of the unused branch sweep
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,

    /// Queue depth above which enqueueing an event logs a warning
    #[serde(default = "default_inbox_warn_depth")]
    pub inbox_warn_depth: usize,
}

// Default value functions
fn default_max_versions() -> usize {
    10
}

fn default_max_unused_seconds() -> u64 {
    1800
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

fn default_inbox_warn_depth() -> usize {
    64
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            max_versions: default_max_versions(),
            max_unused_seconds: default_max_unused_seconds(),
        }
    }
}

impl BranchConfig {
    pub fn max_unused(&self) -> Duration {
        Duration::from_secs(self.max_unused_seconds)
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: default_sweep_interval_seconds(),
            inbox_warn_depth: default_inbox_warn_depth(),
        }
    }
}

impl RegistrySettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

impl GatewayConfig {
    /// Load configuration from default locations
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> std::result::Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Load from default locations
        let config_locations = [
            "gateway.toml",
            ".gateway.toml",
            "config/gateway.toml",
        ];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // Load from XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "familiar", "gateway") {
            let xdg_config = config_dir.config_dir().join("gateway.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        // Load from specified path
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Load from environment variables (GATEWAY__BRANCH__MAX_VERSIONS, ...)
        builder = builder.add_source(
            Environment::with_prefix("GATEWAY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| RegistryError::InvalidConfig(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the registry cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.branch.max_versions == 0 {
            return Err(RegistryError::InvalidConfig(
                "branch.max_versions must be at least 1".to_string(),
            ));
        }
        if self.registry.sweep_interval_seconds == 0 {
            return Err(RegistryError::InvalidConfig(
                "registry.sweep_interval_seconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.branch.max_versions, 10);
        assert_eq!(config.branch.max_unused(), Duration::from_secs(1800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_config() {
        let config = GatewayConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[branch]"));
        assert!(toml_str.contains("[registry]"));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        let mut config = GatewayConfig::default();
        config.branch.max_versions = 1;
        config.save(path.to_str().unwrap()).unwrap();

        let loaded = GatewayConfig::load_from(path.to_str()).unwrap();
        assert_eq!(loaded.branch.max_versions, 1);
        assert_eq!(loaded.registry.sweep_interval_seconds, 60);
    }

    #[test]
    fn test_validate_rejects_zero_history() {
        let mut config = GatewayConfig::default();
        config.branch.max_versions = 0;
        assert!(matches!(config.validate(), Err(RegistryError::InvalidConfig(_))));
    }

    #[test]
    fn test_save_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("gateway.toml");
        let result = GatewayConfig::default().save(path.to_str().unwrap());
        assert!(matches!(result, Err(RegistryError::Io(_))));
    }
}
