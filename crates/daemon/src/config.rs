//! Configuration management for the DevHub daemon.
//!
//! Configuration is read from TOML, by default at
//! `~/.config/devhub/config.toml`. Every section is optional and falls back
//! to its defaults; a few values can be overridden from the environment.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::console::{SupervisorSettings, DEFAULT_SHELL};
use crate::hub::{HubConfig, DEFAULT_BROADCAST_CAPACITY, DEFAULT_OUTBOX_CAPACITY};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("{0} must be greater than 0")]
    ZeroValue(&'static str),

    #[error("default_shell does not exist: {0}")]
    InvalidShellPath(String),

    #[error("domains must not contain empty entries")]
    EmptyDomain,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Default address of the observer endpoint.
pub const DEFAULT_EVENTS_ADDR: &str = "127.0.0.1:9280";

/// Main configuration structure for the DevHub daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub apps: AppsConfig,
    pub console: ConsoleConfig,
    pub hub: HubSection,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Management socket. Unset means the per-user runtime location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,

    /// TCP address observers connect to.
    pub events_addr: SocketAddr,
}

/// Where applications live and how request keys map to them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppsConfig {
    /// Directory holding one entry (usually a symlink) per application.
    pub root_dir: PathBuf,

    /// Top-level domains stripped from request keys.
    pub domains: Vec<String>,

    /// Idle timeout applied to consoles that do not set one (0 = none).
    pub idle_time_secs: u64,
}

/// Console supervision knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsoleConfig {
    pub default_shell: String,
    pub ready_delay_ms: u64,
    pub idle_check_secs: u64,
    pub kill_grace_secs: u64,
    /// How often dead consoles are dropped from the registry.
    pub reap_interval_secs: u64,
}

/// Event hub capacities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubSection {
    /// Per-observer queue length before the observer is evicted.
    pub outbox_capacity: usize,
    /// Broadcast intake queue length.
    pub broadcast_capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            socket_path: None,
            events_addr: default_events_addr(),
        }
    }
}

impl Default for AppsConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            domains: vec!["test".to_string()],
            idle_time_secs: 0,
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            default_shell: DEFAULT_SHELL.to_string(),
            ready_delay_ms: 250,
            idle_check_secs: 10,
            kill_grace_secs: 5,
            reap_interval_secs: 60,
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devhub")
        .join("config.toml")
}

fn default_root_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".devhub")
}

fn default_events_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9280))
}

impl Config {
    /// Apply environment variable overrides. Empty values are ignored.
    ///
    /// - `DEVHUB_LOG_LEVEL`
    /// - `DEVHUB_ROOT_DIR`
    /// - `DEVHUB_EVENTS_ADDR` (ignored with a warning if unparsable)
    pub fn apply_env_overrides(&mut self) {
        if let Some(level) = env_value("DEVHUB_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }

        if let Some(root) = env_value("DEVHUB_ROOT_DIR") {
            tracing::info!("Overriding root_dir from environment: {}", root);
            self.apps.root_dir = PathBuf::from(root);
        }

        if let Some(addr) = env_value("DEVHUB_EVENTS_ADDR") {
            match addr.parse() {
                Ok(addr) => {
                    tracing::info!("Overriding events_addr from environment: {}", addr);
                    self.daemon.events_addr = addr;
                }
                Err(e) => tracing::warn!("Ignoring DEVHUB_EVENTS_ADDR={}: {}", addr, e),
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        if self.apps.domains.iter().any(|d| d.trim().is_empty()) {
            return Err(ConfigError::EmptyDomain);
        }

        let nonzero = [
            ("console.idle_check_secs", self.console.idle_check_secs),
            ("console.reap_interval_secs", self.console.reap_interval_secs),
            ("hub.outbox_capacity", self.hub.outbox_capacity as u64),
            ("hub.broadcast_capacity", self.hub.broadcast_capacity as u64),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroValue(*name));
        }

        let shell = &self.console.default_shell;
        let shell_path = Path::new(shell);
        let found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(shell).is_ok()
        };
        if !found {
            return Err(ConfigError::InvalidShellPath(shell.clone()));
        }

        Ok(())
    }

    /// Management socket location.
    pub fn socket_path(&self) -> PathBuf {
        self.daemon
            .socket_path
            .clone()
            .unwrap_or_else(crate::ipc::get_socket_path)
    }

    /// Timing knobs for console programs.
    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            ready_delay: Duration::from_millis(self.console.ready_delay_ms),
            idle_check_interval: Duration::from_secs(self.console.idle_check_secs),
            kill_grace: Duration::from_secs(self.console.kill_grace_secs),
            default_shell: self.console.default_shell.clone(),
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            outbox_capacity: self.hub.outbox_capacity,
            broadcast_capacity: self.hub.broadcast_capacity,
        }
    }

    /// Idle timeout for consoles that do not ask for one.
    pub fn default_idle_timeout(&self) -> Option<Duration> {
        (self.apps.idle_time_secs > 0).then(|| Duration::from_secs(self.apps.idle_time_secs))
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.console.reap_interval_secs)
    }

    /// Load configuration from a file.
    ///
    /// A missing file yields the defaults; a file that is not valid TOML is
    /// an error naming the file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn valid() -> Config {
        let mut config = Config::default();
        config.console.default_shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.events_addr.to_string(), DEFAULT_EVENTS_ADDR);
        assert!(config.daemon.socket_path.is_none());
        assert!(config.apps.root_dir.ends_with(".devhub"));
        assert_eq!(config.apps.domains, vec!["test"]);
        assert_eq!(config.console.default_shell, "/bin/bash");
        assert_eq!(config.console.ready_delay_ms, 250);
        assert_eq!(config.hub.outbox_capacity, 8192);
        assert_eq!(config.hub.broadcast_capacity, 16);
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[console]
ready_delay_ms = 100
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.console.ready_delay_ms, 100);
        assert_eq!(config.console.kill_grace_secs, 5);
        assert_eq!(config.hub, HubSection::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
log_level = "trace"
socket_path = "/run/devhub.sock"
events_addr = "0.0.0.0:9000"

[apps]
root_dir = "/srv/apps"
domains = ["test", "localhost"]
idle_time_secs = 900

[console]
default_shell = "/bin/zsh"
ready_delay_ms = 500
idle_check_secs = 30
kill_grace_secs = 2
reap_interval_secs = 10

[hub]
outbox_capacity = 64
broadcast_capacity = 4
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.socket_path, Some(PathBuf::from("/run/devhub.sock")));
        assert_eq!(config.socket_path(), PathBuf::from("/run/devhub.sock"));
        assert_eq!(config.daemon.events_addr.port(), 9000);
        assert_eq!(config.apps.root_dir, PathBuf::from("/srv/apps"));
        assert_eq!(config.apps.domains.len(), 2);
        assert_eq!(config.default_idle_timeout(), Some(Duration::from_secs(900)));

        let settings = config.supervisor_settings();
        assert_eq!(settings.ready_delay, Duration::from_millis(500));
        assert_eq!(settings.idle_check_interval, Duration::from_secs(30));
        assert_eq!(settings.kill_grace, Duration::from_secs(2));
        assert_eq!(settings.default_shell, "/bin/zsh");
        assert_eq!(config.reap_interval(), Duration::from_secs(10));

        let hub = config.hub_config();
        assert_eq!(hub.outbox_capacity, 64);
        assert_eq!(hub.broadcast_capacity, 4);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let err = Config::from_toml("[daemon\nlog_level = \"debug\"").unwrap_err();
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_bad_address() {
        let toml = r#"
[daemon]
events_addr = "not an address"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.apps.domains = vec!["dev".to_string()];
        original.hub.broadcast_capacity = 32;

        let loaded = Config::from_toml(&original.to_toml().unwrap()).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.console.kill_grace_secs = 1;
        original.save(&config_path).unwrap();

        assert_eq!(Config::load(&config_path).unwrap(), original);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("devhub"));
        assert!(path.ends_with("config.toml"));
    }

    #[test]
    fn test_idle_time_zero_disables() {
        assert_eq!(Config::default().default_idle_timeout(), None);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("DEVHUB_LOG_LEVEL", "debug");
        std::env::set_var("DEVHUB_ROOT_DIR", "/tmp/devhub-apps");
        std::env::set_var("DEVHUB_EVENTS_ADDR", "127.0.0.1:9999");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("DEVHUB_LOG_LEVEL");
        std::env::remove_var("DEVHUB_ROOT_DIR");
        std::env::remove_var("DEVHUB_EVENTS_ADDR");

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.apps.root_dir, PathBuf::from("/tmp/devhub-apps"));
        assert_eq!(config.daemon.events_addr.port(), 9999);
    }

    #[test]
    #[serial]
    fn test_env_override_empty_or_invalid_ignored() {
        std::env::set_var("DEVHUB_LOG_LEVEL", "");
        std::env::set_var("DEVHUB_EVENTS_ADDR", "nope");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("DEVHUB_LOG_LEVEL");
        std::env::remove_var("DEVHUB_EVENTS_ADDR");

        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_ok() {
        assert_eq!(valid().validate(), Ok(()));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid();
        config.daemon.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_zero_values() {
        let mut config = valid();
        config.hub.broadcast_capacity = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroValue("hub.broadcast_capacity"))
        );

        let mut config = valid();
        config.console.idle_check_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroValue("console.idle_check_secs"))
        );
    }

    #[test]
    fn test_validate_empty_domain() {
        let mut config = valid();
        config.apps.domains.push(" ".to_string());
        assert_eq!(config.validate(), Err(ConfigError::EmptyDomain));
    }

    #[test]
    fn test_validate_shell() {
        let mut config = valid();
        config.console.default_shell = "sh".to_string();
        assert!(config.validate().is_ok());

        config.console.default_shell = "/nonexistent/shell".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));
    }
}
