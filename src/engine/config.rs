//! devfleet Configuration Module
//! Handles loading and validating devfleet.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "devfleet.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Config section missing: {0}")]
    MissingSection(&'static str),
    #[error("Invalid config value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub agent: Option<AgentConfig>,
    /// Directory relative paths are resolved against. Set on load.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Filter directive used when neither DEVFLEET_LOG nor RUST_LOG is set
    #[serde(default)]
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,
    #[serde(default = "default_keystore_path")]
    pub keystore_path: PathBuf,
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: PathBuf,
    /// Largest accepted package upload
    #[serde(default = "default_max_package_bytes")]
    pub max_package_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_path: default_database_path(),
            blob_dir: default_blob_dir(),
            keystore_path: default_keystore_path(),
            audit_log_path: default_audit_log_path(),
            max_package_bytes: default_max_package_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub server_url: String,
    /// Generated and persisted under `state_dir` when absent
    #[serde(default)]
    pub device_uuid: Option<String>,
    pub display_name: String,
    pub timezone: String,
    /// Application tree managed by the agent
    pub app_dir: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_transfer_attempts")]
    pub transfer_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default)]
    pub maintenance_window: WindowConfig,
    #[serde(default = "default_urgent_idle_minutes")]
    pub urgent_idle_minutes: u64,
    /// Restart command; a marker file is written when unset
    #[serde(default)]
    pub restart_command: Option<Vec<String>>,
    #[serde(default = "default_package_install_command")]
    pub package_install_command: Vec<String>,
    /// Overrides the built-in protected-path manifest
    #[serde(default)]
    pub protected_manifest: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowConfig {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            start_hour: 2,
            end_hour: 5,
        }
    }
}

fn default_port() -> u16 {
    54380
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/devfleet.db")
}

fn default_blob_dir() -> PathBuf {
    PathBuf::from("./data/packages")
}

fn default_keystore_path() -> PathBuf {
    PathBuf::from("./data/keys.json")
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("./data/audit.jsonl")
}

fn default_max_package_bytes() -> usize {
    256 * 1024 * 1024
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./agent-state")
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_transfer_attempts() -> u32 {
    2
}

fn default_backoff_base_secs() -> u64 {
    60
}

fn default_backoff_max_secs() -> u64 {
    3600
}

fn default_urgent_idle_minutes() -> u64 {
    60
}

fn default_package_install_command() -> Vec<String> {
    vec!["apt-get".to_string(), "install".to_string(), "-y".to_string()]
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&content)?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Server-only config written by `devfleet init`
    pub fn default_server() -> Self {
        Self {
            logging: LoggingConfig::default(),
            server: Some(ServerConfig::default()),
            agent: None,
            base_dir: PathBuf::from("."),
        }
    }

    /// Resolve a configured path against the config file's directory
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn server(&self) -> Result<&ServerConfig, ConfigError> {
        self.server.as_ref().ok_or(ConfigError::MissingSection("server"))
    }

    pub fn agent(&self) -> Result<&AgentConfig, ConfigError> {
        self.agent.as_ref().ok_or(ConfigError::MissingSection("agent"))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(agent) = &self.agent {
            let window = agent.maintenance_window;
            if window.start_hour > 23 || window.end_hour > 23 {
                return Err(ConfigError::Invalid(
                    "maintenance_window hours must be within 0..=23".to_string(),
                ));
            }
            if window.start_hour == window.end_hour {
                return Err(ConfigError::Invalid(
                    "maintenance_window must not be empty".to_string(),
                ));
            }
            if agent.timezone.parse::<chrono_tz::Tz>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "unknown timezone {}",
                    agent.timezone
                )));
            }
            if agent.transfer_attempts == 0 {
                return Err(ConfigError::Invalid(
                    "transfer_attempts must be at least 1".to_string(),
                ));
            }
            if agent.package_install_command.is_empty() {
                return Err(ConfigError::Invalid(
                    "package_install_command must name a program".to_string(),
                ));
            }
            if agent.server_url.trim().is_empty() {
                return Err(ConfigError::Invalid("server_url is empty".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_config() {
        let dir = tempdir().unwrap();
        let err = Config::load(&dir.path().join(CONFIG_FILE_NAME)).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_agent_defaults_and_resolve() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"{
                "agent": {
                    "server_url": "http://127.0.0.1:54380",
                    "display_name": "Kitchen",
                    "timezone": "America/Los_Angeles",
                    "app_dir": "app"
                }
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        let agent = config.agent().unwrap();
        assert_eq!(agent.transfer_attempts, 2);
        assert_eq!(agent.urgent_idle_minutes, 60);
        assert_eq!(agent.maintenance_window, WindowConfig::default());
        assert_eq!(config.resolve(&agent.app_dir), dir.path().join("app"));
        assert!(config.server().is_err());
    }

    #[test]
    fn test_rejects_bad_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"{
                "agent": {
                    "server_url": "http://localhost",
                    "display_name": "Hall",
                    "timezone": "UTC",
                    "app_dir": "app",
                    "maintenance_window": { "start_hour": 25, "end_hour": 3 }
                }
            }"#,
        )
        .unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        Config::default_server().save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server().unwrap().port, 54380);
    }
}
