//! Server configuration
//!
//! Read from a TOML file, then overridden by `PORT` and `AFK_CHECK_MINS`.
//! A missing file means defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chronos_core::{Error, Result, TimingConfig};
use directories::ProjectDirs;
use serde::Deserialize;
use tracing::warn;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "CHRONOS_CONFIG";

/// A credential known at startup
#[derive(Debug, Clone, Deserialize)]
pub struct StaticUser {
    pub alias: String,
    pub token: String,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Idle sessions older than this are killed
    pub idle_timeout_mins: u64,
    pub sweep_interval_mins: u64,
    pub timing: TimingConfig,
    pub users: Vec<StaticUser>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: chronos_net::DEFAULT_PORT,
            idle_timeout_mins: 48 * 60,
            sweep_interval_mins: 30,
            timing: TimingConfig::default(),
            users: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load from `path`, or defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Load from the default location and apply environment overrides
    pub fn load_default() -> Result<Self> {
        let mut config = Self::load(&config_path()?)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `PORT` and `AFK_CHECK_MINS`. Unparseable values are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = var("PORT") {
            match raw.trim().parse() {
                Ok(port) => self.port = port,
                Err(_) => warn!(value = %raw, "Ignoring invalid PORT"),
            }
        }
        if let Some(raw) = var("AFK_CHECK_MINS") {
            match raw.trim().parse() {
                Ok(mins) => self.idle_timeout_mins = mins,
                Err(_) => warn!(value = %raw, "Ignoring invalid AFK_CHECK_MINS"),
            }
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_mins * 60)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_mins.max(1) * 60)
    }
}

/// `CHRONOS_CONFIG`, else `chronos.toml` in the platform config directory
pub fn config_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    let dirs = ProjectDirs::from("dev", "onyx", "chronos").ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not determine config directory",
        ))
    })?;
    Ok(dirs.config_dir().join("chronos.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.port, 4500);
        assert_eq!(config.idle_timeout(), Duration::from_secs(48 * 60 * 60));
        assert_eq!(config.sweep_interval(), Duration::from_secs(30 * 60));
        assert!(config.users.is_empty());
    }

    #[test]
    fn test_load_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chronos.toml");
        std::fs::write(
            &path,
            r#"
port = 9000
idle_timeout_mins = 5

[timing]
lock_window_ms = 800

[[users]]
alias = "ops"
token = "s3cret"
admin = true

[[users]]
alias = "judge"
token = "other"
"#,
        )
        .unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.idle_timeout_mins, 5);
        assert_eq!(config.sweep_interval_mins, 30);
        assert_eq!(config.timing.lock_window_ms, 800);
        assert_eq!(config.timing.heartbeat_ms, 250);
        assert_eq!(config.users.len(), 2);
        assert!(config.users[0].admin);
        assert!(!config.users[1].admin);
    }

    #[test]
    fn test_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chronos.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(matches!(ServerConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [("PORT", "4600"), ("AFK_CHECK_MINS", "90")].into();
        let mut config = ServerConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.port, 4600);
        assert_eq!(config.idle_timeout_mins, 90);
    }

    #[test]
    fn test_bad_env_is_ignored() {
        let mut config = ServerConfig::default();
        config.apply_env(|key| (key == "PORT").then(|| "http".to_string()));
        assert_eq!(config.port, 4500);
    }
}
