//! CLI configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (from `--config`, or MOTIF_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,
    /// Scenario runner configuration.
    pub simulate: SimulateConfig,
}

impl Config {
    /// Loads configuration from `path` (or MOTIF_CONFIG), then applies
    /// environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("MOTIF_CONFIG").ok().map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        self.log.apply_overrides(&var);
        self.simulate.apply_overrides(&var);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.simulate.max_actions == 0 {
            return Err(ConfigError::ValidationError(
                "simulate.max_actions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter used when RUST_LOG is not set.
    pub filter: String,
    /// Colored log output.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            ansi: true,
        }
    }
}

impl LogConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(filter) = var("MOTIF_LOG") {
            self.filter = filter;
        }

        if let Some(ansi) = var("MOTIF_LOG_ANSI") {
            if let Ok(parsed) = ansi.parse() {
                self.ansi = parsed;
            }
        }
    }
}

/// Scenario runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulateConfig {
    /// Scenarios with more actions are rejected.
    pub max_actions: usize,
    /// Print each step's input when it becomes ready.
    pub print_state: bool,
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            max_actions: 1000,
            print_state: true,
        }
    }
}

impl SimulateConfig {
    fn apply_overrides(&mut self, var: &impl Fn(&str) -> Option<String>) {
        if let Some(max) = var("MOTIF_MAX_ACTIONS") {
            if let Ok(n) = max.parse() {
                self.max_actions = n;
            }
        }

        if let Some(print) = var("MOTIF_PRINT_STATE") {
            if let Ok(parsed) = print.parse() {
                self.print_state = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log.filter, "info");
        assert!(config.log.ansi);
        assert_eq!(config.simulate.max_actions, 1000);
        assert!(config.simulate.print_state);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_partial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("motif.yaml");
        std::fs::write(&path, "simulate:\n  max_actions: 5\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.simulate.max_actions, 5);
        assert!(config.simulate.print_state);
        assert_eq!(config.log.filter, "info");
    }

    #[test]
    fn test_from_file_errors() {
        let dir = TempDir::new().unwrap();
        let missing = Config::from_file(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(missing, ConfigError::IoError(..)));

        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "log: [1, 2").unwrap();
        let bad = Config::from_file(&path).unwrap_err();
        assert!(bad.to_string().starts_with("failed to parse config file"));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MOTIF_LOG", "motif_core=debug"),
            ("MOTIF_LOG_ANSI", "false"),
            ("MOTIF_MAX_ACTIONS", "12"),
            ("MOTIF_PRINT_STATE", "not-a-bool"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.log.filter, "motif_core=debug");
        assert!(!config.log.ansi);
        assert_eq!(config.simulate.max_actions, 12);
        assert!(config.simulate.print_state);
    }

    #[test]
    fn test_load_validates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("motif.yaml");
        std::fs::write(&path, "simulate:\n  max_actions: 0\n").unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.simulate.max_actions, config.simulate.max_actions);
    }
}
