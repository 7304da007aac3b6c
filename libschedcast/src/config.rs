//! Configuration management for Schedcast
//!
//! Every section and field has a default, so a missing file or a partial
//! file is valid. `SCHEDCAST_DB_PATH` overrides `database.path` after the
//! file is read.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scheduling: SchedulingConfig,
    pub platforms: PlatformsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/schedcast/posts.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Longest the engine sleeps between due checks, in seconds
    pub poll_interval: u64,
    /// Re-register pending posts when the daemon starts. When false the
    /// posts still load on the first reconcile pass, one interval later.
    pub restore_on_startup: bool,
    /// Seconds between store reconcile passes in the daemon
    pub reconcile_interval: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            poll_interval: 1,
            restore_on_startup: true,
            reconcile_interval: 30,
        }
    }
}

impl SchedulingConfig {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_secs(self.poll_interval.max(1)),
        }
    }

    pub fn reconcile_every(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformsConfig {
    /// Platforms the daemon registers a publisher for
    pub enabled: Vec<String>,
}

impl Default for PlatformsConfig {
    fn default() -> Self {
        Self {
            enabled: vec![
                "twitter".to_string(),
                "facebook".to_string(),
                "instagram".to_string(),
            ],
        }
    }
}

impl Config {
    /// Load configuration from the default location
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        let mut config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            tracing::debug!(
                "No config file at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Apply `SCHEDCAST_DB_PATH` if set
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("SCHEDCAST_DB_PATH") {
            if !path.trim().is_empty() {
                self.database.path = path;
            }
        }
    }

    /// Database path with `~` expanded
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).to_string())
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SCHEDCAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("schedcast").join("config.toml"))
}

/// Resolve the data directory path following XDG Base Directory spec
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("schedcast"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.scheduling.poll_interval, 1);
        assert!(config.scheduling.restore_on_startup);
        assert_eq!(config.scheduling.reconcile_interval, 30);
        assert_eq!(config.platforms.enabled.len(), 3);
        assert!(config.database.path.ends_with("schedcast/posts.db"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = Config::parse(
            r#"
[scheduling]
poll_interval = 5

[platforms]
enabled = ["facebook"]
"#,
        )
        .unwrap();

        assert_eq!(config.scheduling.poll_interval, 5);
        assert_eq!(config.scheduling.reconcile_interval, 30);
        assert_eq!(config.platforms.enabled, vec!["facebook"]);
        assert_eq!(config.database, DatabaseConfig::default());
        assert_eq!(
            config.scheduling.engine_config().poll_interval,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config = Config::parse("[scheduling]\npoll_interval = 0\nreconcile_interval = 0\n")
            .unwrap();
        assert_eq!(
            config.scheduling.engine_config().poll_interval,
            Duration::from_secs(1)
        );
        assert_eq!(config.scheduling.reconcile_every(), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let err = Config::parse("[scheduling\npoll_interval = ").unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    #[serial]
    fn test_load_from_env_path() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[database]\npath = \"/tmp/schedcast-test.db\"").unwrap();

        std::env::set_var("SCHEDCAST_CONFIG", file.path());
        std::env::remove_var("SCHEDCAST_DB_PATH");
        let config = Config::load().unwrap();
        std::env::remove_var("SCHEDCAST_CONFIG");

        assert_eq!(config.database.path, "/tmp/schedcast-test.db");
    }

    #[test]
    #[serial]
    fn test_missing_file_gives_defaults_with_db_override() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("SCHEDCAST_CONFIG", dir.path().join("absent.toml"));
        std::env::set_var("SCHEDCAST_DB_PATH", "/tmp/override.db");

        let config = Config::load().unwrap();

        std::env::remove_var("SCHEDCAST_CONFIG");
        std::env::remove_var("SCHEDCAST_DB_PATH");

        assert_eq!(config.database.path, "/tmp/override.db");
        assert_eq!(config.scheduling, SchedulingConfig::default());
    }

    #[test]
    #[serial]
    fn test_resolve_config_path_expands_tilde() {
        std::env::set_var("SCHEDCAST_CONFIG", "~/schedcast.toml");
        let path = resolve_config_path().unwrap();
        std::env::remove_var("SCHEDCAST_CONFIG");

        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with("schedcast.toml"));
    }
}
