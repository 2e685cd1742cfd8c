//! Configuration management for the evolution engine
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (evolution.toml)
//! - Environment variables (EVOLUTION__*)
//!
//! ## Example config file (evolution.toml):
//! ```toml
//! [registry]
//! path = "./schema-state"
//! default_mode = "BACKWARD"
//! git_commits = true
//! default_author = "Data Platform"
//!
//! [lifecycle]
//! overlap_period_secs = 1209600
//! usage_window_secs = 604800
//! usage_threshold = 0
//!
//! [sweep]
//! interval_secs = 60
//! ```

use chrono::Duration;
use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::compatibility::CompatibilityMode;
use crate::deprecation::LifecyclePolicy;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvolutionConfig {
    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    #[serde(default)]
    pub sweep: SweepConfig,
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Root of the persisted state
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,

    /// Mode applied to entities without an explicit one
    #[serde(default)]
    pub default_mode: CompatibilityMode,

    /// Commit every state write to a git repository at `path`
    #[serde(default)]
    pub git_commits: bool,

    /// Author recorded on commits and audit entries
    #[serde(default)]
    pub default_author: Option<String>,
}

/// Deprecation lifecycle tunables, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_overlap_secs")]
    pub overlap_period_secs: i64,

    #[serde(default = "default_window_secs")]
    pub usage_window_secs: i64,

    #[serde(default)]
    pub usage_threshold: usize,

    #[serde(default = "default_extension_secs")]
    pub deadline_extension_secs: i64,

    #[serde(default = "default_warning_secs")]
    pub approaching_warning_secs: i64,

    #[serde(default = "default_retention_secs")]
    pub retention_secs: i64,
}

/// Sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

// Default value functions
fn default_registry_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_overlap_secs() -> i64 {
    14 * 24 * 3600
}

fn default_window_secs() -> i64 {
    7 * 24 * 3600
}

fn default_extension_secs() -> i64 {
    7 * 24 * 3600
}

fn default_warning_secs() -> i64 {
    3 * 24 * 3600
}

fn default_retention_secs() -> i64 {
    30 * 24 * 3600
}

fn default_interval_secs() -> u64 {
    60
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
            default_mode: CompatibilityMode::default(),
            git_commits: false,
            default_author: None,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            overlap_period_secs: default_overlap_secs(),
            usage_window_secs: default_window_secs(),
            usage_threshold: 0,
            deadline_extension_secs: default_extension_secs(),
            approaching_warning_secs: default_warning_secs(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

impl LifecycleConfig {
    /// Runtime view as durations
    pub fn policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            overlap_period: Duration::seconds(self.overlap_period_secs),
            usage_window: Duration::seconds(self.usage_window_secs),
            usage_threshold: self.usage_threshold,
            deadline_extension: Duration::seconds(self.deadline_extension_secs),
            approaching_warning: Duration::seconds(self.approaching_warning_secs),
            retention: Duration::seconds(self.retention_secs),
        }
    }
}

impl EvolutionConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration, layering an explicit file over the defaults
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let config_locations = ["evolution.toml", ".evolution.toml", "config/evolution.toml"];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        if let Some(config_dir) = directories::ProjectDirs::from("dev", "schema-evolution", "evolution") {
            let xdg_config = config_dir.config_dir().join("evolution.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // EVOLUTION__LIFECYCLE__USAGE_THRESHOLD=2
        builder = builder.add_source(
            Environment::with_prefix("EVOLUTION")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Registry path with relative paths resolved against the working directory
    pub fn registry_path(&self) -> PathBuf {
        if self.registry.path.is_absolute() {
            self.registry.path.clone()
        } else {
            std::env::current_dir()
                .unwrap_or_default()
                .join(&self.registry.path)
        }
    }

    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        self.lifecycle.policy()
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep.interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EvolutionConfig::default();
        assert_eq!(config.registry.default_mode, CompatibilityMode::Backward);
        assert!(!config.registry.git_commits);
        assert_eq!(config.lifecycle_policy(), LifecyclePolicy::default());
    }

    #[test]
    fn test_serialize_config() {
        let config = EvolutionConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[registry]"));
        assert!(toml_str.contains("[lifecycle]"));
        assert!(toml_str.contains("default_mode = \"BACKWARD\""));
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[registry]\ndefault_mode = \"FULL\"\n\n[lifecycle]\nusage_threshold = 3\noverlap_period_secs = 60\n",
        )
        .unwrap();

        let config = EvolutionConfig::load_from(path.to_str()).unwrap();
        assert_eq!(config.registry.default_mode, CompatibilityMode::Full);
        let policy = config.lifecycle_policy();
        assert_eq!(policy.usage_threshold, 3);
        assert_eq!(policy.overlap_period, Duration::seconds(60));
        assert_eq!(policy.usage_window, Duration::days(7));
    }
}
