//! Configuration management for the termgate gateway.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termgate/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::{ReclaimConfig, RegistryOptions};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bind must be a socket address such as 127.0.0.1:3001, got {0}")]
    InvalidBindAddress(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("default_shell not found: {0}")]
    InvalidShellPath(String),

    #[error("max_sessions must be at most 10000 (0 = unlimited), got {0}")]
    InvalidMaxSessions(usize),

    #[error("exit_grace_ms must be at most 60000, got {0}")]
    InvalidExitGrace(u64),

    #[error("reclaim interval_secs must be greater than 0")]
    InvalidReclaimInterval,

    #[error("reclaim stale_after_secs must be greater than 0")]
    InvalidStaleThreshold,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const MAX_SESSIONS_LIMIT: usize = 10_000;

const MAX_EXIT_GRACE_MS: u64 = 60_000;

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and logging settings.
    pub server: ServerConfig,

    /// Shell session settings.
    pub session: SessionConfig,

    /// Stale session sweep settings.
    pub reclaim: ReclaimSettings,
}

/// Listener and logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub bind: String,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Shell session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell started for every session.
    pub default_shell: String,

    /// Arguments passed to the shell.
    pub shell_args: Vec<String>,

    /// Directory used when a client does not send `cwd`. Empty means the
    /// gateway's working directory.
    pub default_cwd: String,

    /// Maximum number of concurrent sessions (0 = unlimited).
    pub max_sessions: usize,

    /// Milliseconds an exited session stays bound before it is destroyed.
    pub exit_grace_ms: u64,
}

/// Stale session sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReclaimSettings {
    /// Seconds between sweeps.
    pub interval_secs: u64,

    /// Idle seconds after which a session is destroyed.
    pub stale_after_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3001".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            shell_args: Vec::new(),
            default_cwd: String::new(),
            max_sessions: 0,
            exit_grace_ms: 1000,
        }
    }
}

impl Default for ReclaimSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            stale_after_secs: 3600,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termgate")
        .join("config.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMGATE_BIND: Override the listen address
    /// - TERMGATE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMGATE_SHELL: Override the shell
    pub fn apply_env_overrides(&mut self) {
        if let Some(bind) = non_empty_env("TERMGATE_BIND") {
            tracing::info!("Overriding bind from environment: {}", bind);
            self.server.bind = bind;
        }

        if let Some(level) = non_empty_env("TERMGATE_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.server.log_level = level;
        }

        if let Some(shell) = non_empty_env("TERMGATE_SHELL") {
            tracing::info!("Overriding default_shell from environment: {}", shell);
            self.session.default_shell = shell;
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;

        let level = self.server.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.server.log_level.clone()));
        }

        let shell_path = Path::new(&self.session.default_shell);
        let shell_found = if shell_path.is_absolute() {
            shell_path.exists()
        } else {
            which::which(&self.session.default_shell).is_ok()
        };
        if !shell_found {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        if self.session.max_sessions > MAX_SESSIONS_LIMIT {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.exit_grace_ms > MAX_EXIT_GRACE_MS {
            return Err(ConfigError::InvalidExitGrace(self.session.exit_grace_ms));
        }

        if self.reclaim.interval_secs == 0 {
            return Err(ConfigError::InvalidReclaimInterval);
        }

        if self.reclaim.stale_after_secs == 0 {
            return Err(ConfigError::InvalidStaleThreshold);
        }

        Ok(())
    }

    /// The listen address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind
            .parse()
            .map_err(|_| ConfigError::InvalidBindAddress(self.server.bind.clone()))
    }

    /// How the session registry should start shells.
    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions::new(self.session.default_shell.clone())
            .with_shell_args(self.session.shell_args.iter().cloned())
            .with_max_sessions(self.session.max_sessions)
    }

    /// Delay between a shell exiting and its session being destroyed.
    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.session.exit_grace_ms)
    }

    /// Stale session sweep schedule.
    pub fn reclaim_config(&self) -> ReclaimConfig {
        ReclaimConfig {
            interval: Duration::from_secs(self.reclaim.interval_secs),
            stale_after: Duration::from_secs(self.reclaim.stale_after_secs),
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
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

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
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

    /// A config that passes validation on any unix host.
    fn valid_config() -> Config {
        let mut config = Config::default();
        config.session.default_shell = "/bin/sh".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.bind, "127.0.0.1:3001");
        assert_eq!(config.server.log_level, "info");
        assert!(config.session.shell_args.is_empty());
        assert!(config.session.default_cwd.is_empty());
        assert_eq!(config.session.max_sessions, 0);
        assert_eq!(config.session.exit_grace_ms, 1000);
        assert_eq!(config.reclaim.interval_secs, 60);
        assert_eq!(config.reclaim.stale_after_secs, 3600);
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[server]
log_level = "debug"

[session]
max_sessions = 5
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.session.max_sessions, 5);
        assert_eq!(config.server.bind, "127.0.0.1:3001");
        assert_eq!(config.reclaim, ReclaimSettings::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[server]
bind = "0.0.0.0:8080"
log_level = "trace"

[session]
default_shell = "/bin/zsh"
shell_args = ["-l"]
default_cwd = "/srv"
max_sessions = 20
exit_grace_ms = 250

[reclaim]
interval_secs = 30
stale_after_secs = 600
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.server.log_level, "trace");
        assert_eq!(config.session.default_shell, "/bin/zsh");
        assert_eq!(config.session.shell_args, vec!["-l"]);
        assert_eq!(config.session.default_cwd, "/srv");
        assert_eq!(config.session.max_sessions, 20);
        assert_eq!(config.exit_grace(), Duration::from_millis(250));
        assert_eq!(
            config.reclaim_config(),
            ReclaimConfig {
                interval: Duration::from_secs(30),
                stale_after: Duration::from_secs(600),
            }
        );
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[server
log_level = "debug"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
        assert!(err.contains("at position"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
max_sessions = "not a number"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.server.log_level = "warn".to_string();
        original.session.shell_args = vec!["-i".to_string()];
        original.session.max_sessions = 42;
        original.reclaim.stale_after_secs = 120;

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[server]"));
        assert!(toml.contains("[session]"));
        assert!(toml.contains("[reclaim]"));

        let loaded = Config::from_toml(&toml).unwrap();
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
        original.server.bind = "127.0.0.1:9000".to_string();
        original.session.exit_grace_ms = 500;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("termgate"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert_eq!(valid_config().validate(), Ok(()));
    }

    #[test]
    fn test_validate_bind_address() {
        let mut config = valid_config();
        config.server.bind = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBindAddress("localhost".to_string()))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = valid_config();
        config.server.log_level = "loud".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );

        config.server.log_level = "DEBUG".to_string();
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_validate_shell() {
        let mut config = valid_config();
        config.session.default_shell = "/no/such/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath("/no/such/shell".to_string()))
        );

        config.session.default_shell = "definitely-not-a-real-shell-binary".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));

        config.session.default_shell = "sh".to_string();
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = valid_config();
        config.session.max_sessions = MAX_SESSIONS_LIMIT + 1;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxSessions(MAX_SESSIONS_LIMIT + 1))
        );

        let mut config = valid_config();
        config.session.exit_grace_ms = MAX_EXIT_GRACE_MS + 1;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidExitGrace(MAX_EXIT_GRACE_MS + 1))
        );

        let mut config = valid_config();
        config.reclaim.interval_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidReclaimInterval));

        let mut config = valid_config();
        config.reclaim.stale_after_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidStaleThreshold));
    }

    #[test]
    fn test_registry_options() {
        let mut config = valid_config();
        config.session.shell_args = vec!["-l".to_string()];
        config.session.max_sessions = 3;

        let options = config.registry_options();
        assert_eq!(options.shell, "/bin/sh");
        assert_eq!(options.shell_args, vec!["-l"]);
        assert_eq!(options.max_sessions, 3);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("TERMGATE_BIND", "0.0.0.0:4000");
        std::env::set_var("TERMGATE_LOG_LEVEL", "debug");
        std::env::set_var("TERMGATE_SHELL", "/bin/bash");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.server.bind, "0.0.0.0:4000");
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.session.default_shell, "/bin/bash");

        std::env::remove_var("TERMGATE_BIND");
        std::env::remove_var("TERMGATE_LOG_LEVEL");
        std::env::remove_var("TERMGATE_SHELL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("TERMGATE_BIND", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.server.bind, "127.0.0.1:3001");

        std::env::remove_var("TERMGATE_BIND");
    }
}
