//! Configuration management for the TabShell daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/tabshell/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest accepted `max_frame_bytes`: one output read with every byte
/// escaped as `\u00XX`, plus the event envelope.
pub const MIN_FRAME_BYTES: usize = crate::session::READ_CHUNK_SIZE * 6 + 1024;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port must not be 0")]
    InvalidPort,

    #[error("max_frame_bytes must be at least {min}, got {0}", min = MIN_FRAME_BYTES)]
    InvalidMaxFrameBytes(usize),

    #[error("host must not be empty")]
    EmptyHost,

    #[error("user must not be empty (set [ssh].user or $USER)")]
    EmptyUser,

    #[error("ssh binary not found: {0}")]
    SshBinaryNotFound(String),

    #[error("connect_timeout_secs must be between 1 and 300, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("program must not be empty")]
    EmptyProgram,

    #[error("close_timeout_secs must be between 1 and 300, got {0}")]
    InvalidCloseTimeout(u64),

    #[error("max_tabs_per_connection must be between 1 and 100, got {0}")]
    InvalidMaxTabs(usize),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the TabShell daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// WebSocket listener configuration.
    pub server: ServerConfig,

    /// Remote shell connection configuration.
    pub ssh: SshConfig,

    /// Session behaviour.
    pub session: SessionConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon state (PID file, logs).
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Optional log file; rotated daily. Logs go to stderr when unset.
    pub log_file: Option<PathBuf>,
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind_address: String,

    /// Port to listen on.
    pub port: u16,

    /// Largest accepted or produced event frame in bytes.
    pub max_frame_bytes: usize,
}

/// Remote shell connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    /// OpenSSH client binary.
    pub binary: String,

    /// Host the shells run on.
    pub host: String,

    /// SSH port.
    pub port: u16,

    /// Remote login name.
    pub user: String,

    /// Private keys tried before any password. Missing files are skipped.
    pub identity_files: Vec<PathBuf>,

    /// Check host keys against known_hosts.
    pub verify_host_keys: bool,

    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,

    /// `TERM` requested for the remote PTY.
    pub term_type: String,
}

/// Session behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Program exec'd in the workspace.
    pub program: String,

    /// Delay between shell start and the initial command, in milliseconds.
    pub startup_delay_ms: u64,

    /// Upper bound on releasing a remote session, in seconds.
    pub close_timeout_secs: u64,

    /// Maximum number of tabs a single client may hold.
    pub max_tabs_per_connection: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 6388,
            max_frame_bytes: tabshell_protocol::MAX_FRAME_SIZE,
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            host: "localhost".to_string(),
            port: 22,
            user: default_user(),
            identity_files: default_identity_files(),
            verify_host_keys: false,
            connect_timeout_secs: 10,
            term_type: "xterm-256color".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            startup_delay_ms: 500,
            close_timeout_secs: 5,
            max_tabs_per_connection: crate::session::DEFAULT_MAX_TABS,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tabshell")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tabshell")
}

fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_default()
}

fn default_identity_files() -> Vec<PathBuf> {
    let ssh_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ssh");
    ["id_rsa", "id_ed25519", "id_ecdsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .collect()
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TABSHELL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TABSHELL_PORT: Override listening port
    /// - TABSHELL_SSH_HOST: Override the remote host
    /// - TABSHELL_PROGRAM: Override the program started in each tab
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TABSHELL_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(port) = std::env::var("TABSHELL_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.server.port = port;
                }
                Err(_) => tracing::warn!("Ignoring invalid TABSHELL_PORT: {}", port),
            }
        }

        if let Ok(host) = std::env::var("TABSHELL_SSH_HOST") {
            if !host.is_empty() {
                tracing::info!("Overriding ssh host from environment: {}", host);
                self.ssh.host = host;
            }
        }

        if let Ok(program) = std::env::var("TABSHELL_PROGRAM") {
            if !program.is_empty() {
                tracing::info!("Overriding program from environment: {}", program);
                self.session.program = program;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.server.max_frame_bytes < MIN_FRAME_BYTES {
            return Err(ConfigError::InvalidMaxFrameBytes(self.server.max_frame_bytes));
        }

        if self.ssh.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        if self.ssh.user.trim().is_empty() {
            return Err(ConfigError::EmptyUser);
        }

        if !(1..=300).contains(&self.ssh.connect_timeout_secs) {
            return Err(ConfigError::InvalidConnectTimeout(
                self.ssh.connect_timeout_secs,
            ));
        }

        // Validate the ssh binary can be found
        let binary = Path::new(&self.ssh.binary);
        let found = if binary.is_absolute() {
            binary.exists()
        } else {
            which::which(&self.ssh.binary).is_ok()
        };
        if !found {
            return Err(ConfigError::SshBinaryNotFound(self.ssh.binary.clone()));
        }

        if self.session.program.trim().is_empty() {
            return Err(ConfigError::EmptyProgram);
        }

        if !(1..=300).contains(&self.session.close_timeout_secs) {
            return Err(ConfigError::InvalidCloseTimeout(
                self.session.close_timeout_secs,
            ));
        }

        if !(1..=100).contains(&self.session.max_tabs_per_connection) {
            return Err(ConfigError::InvalidMaxTabs(
                self.session.max_tabs_per_connection,
            ));
        }

        // Validate log_level is a known value
        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
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

    /// A config that validates on any machine: `sh` stands in for `ssh`.
    fn valid_config() -> Config {
        let mut config = Config::default();
        config.ssh.binary = "sh".to_string();
        config.ssh.user = "tester".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.daemon.log_file, None);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.server.port, 6388);
        assert_eq!(config.server.max_frame_bytes, 1024 * 1024);
        assert_eq!(config.ssh.host, "localhost");
        assert_eq!(config.ssh.port, 22);
        assert!(!config.ssh.verify_host_keys);
        assert_eq!(config.ssh.term_type, "xterm-256color");
        assert_eq!(config.session.program, "claude");
        assert_eq!(config.session.startup_delay_ms, 500);
        assert_eq!(config.session.close_timeout_secs, 5);
        assert_eq!(config.session.max_tabs_per_connection, 10);
    }

    #[test]
    fn test_default_identity_files() {
        let files = SshConfig::default().identity_files;
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["id_rsa", "id_ed25519", "id_ecdsa"]);
        assert!(files.iter().all(|p| p.parent().unwrap().ends_with(".ssh")));
    }

    #[test]
    fn test_default_data_dir() {
        let config = DaemonConfig::default();
        assert!(config.data_dir.to_string_lossy().contains("tabshell"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("tabshell/config.toml"));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = Config::from_toml(
            r#"
            [server]
            port = 7000

            [session]
            program = "bash"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.session.program, "bash");
        assert_eq!(config.session.startup_delay_ms, 500);
    }

    #[test]
    fn test_from_toml_invalid() {
        let err = Config::from_toml("[server]\nport = \"not a number\"").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Invalid TOML configuration"), "{}", msg);
        assert!(msg.contains("at position"), "{}", msg);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = valid_config();
        config.daemon.log_file = Some(PathBuf::from("/var/log/tabshell.log"));
        config.ssh.identity_files = vec![PathBuf::from("/keys/id_ed25519")];

        let toml = config.to_toml().unwrap();
        assert_eq!(Config::from_toml(&toml).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = valid_config();
        config.server.port = 9000;
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_reports_path_on_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server\nport = 1").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("config.toml"));
    }

    #[test]
    fn test_validate_accepts_valid_config() {
        assert_eq!(valid_config().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = valid_config();
        config.server.port = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPort));

        let mut config = valid_config();
        config.server.max_frame_bytes = 10;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxFrameBytes(10)));

        // One output read can need more than 4 KiB once escaped.
        let mut config = valid_config();
        config.server.max_frame_bytes = 4096;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxFrameBytes(4096)));
        config.server.max_frame_bytes = MIN_FRAME_BYTES;
        assert_eq!(config.validate(), Ok(()));

        let mut config = valid_config();
        config.ssh.host = " ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyHost));

        let mut config = valid_config();
        config.ssh.user = String::new();
        assert_eq!(config.validate(), Err(ConfigError::EmptyUser));

        let mut config = valid_config();
        config.ssh.connect_timeout_secs = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidConnectTimeout(0)));

        let mut config = valid_config();
        config.session.program = String::new();
        assert_eq!(config.validate(), Err(ConfigError::EmptyProgram));

        let mut config = valid_config();
        config.session.close_timeout_secs = 301;
        assert_eq!(config.validate(), Err(ConfigError::InvalidCloseTimeout(301)));

        let mut config = valid_config();
        config.session.max_tabs_per_connection = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxTabs(0)));

        let mut config = valid_config();
        config.daemon.log_level = "loud".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("loud".to_string()))
        );
    }

    #[test]
    fn test_validate_missing_ssh_binary() {
        let mut config = valid_config();
        config.ssh.binary = "tabshell-no-such-ssh-binary".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::SshBinaryNotFound(
                "tabshell-no-such-ssh-binary".to_string()
            ))
        );

        config.ssh.binary = "/nonexistent/bin/ssh".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SshBinaryNotFound(_))
        ));
    }

    #[test]
    fn test_log_level_case_insensitive() {
        let mut config = valid_config();
        config.daemon.log_level = "DEBUG".to_string();
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("TABSHELL_LOG_LEVEL", "debug");
        std::env::set_var("TABSHELL_PORT", "7777");
        std::env::set_var("TABSHELL_SSH_HOST", "devbox");
        std::env::set_var("TABSHELL_PROGRAM", "bash");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("TABSHELL_LOG_LEVEL");
        std::env::remove_var("TABSHELL_PORT");
        std::env::remove_var("TABSHELL_SSH_HOST");
        std::env::remove_var("TABSHELL_PROGRAM");

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.server.port, 7777);
        assert_eq!(config.ssh.host, "devbox");
        assert_eq!(config.session.program, "bash");
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_port_ignored() {
        std::env::set_var("TABSHELL_PORT", "not-a-port");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("TABSHELL_PORT");
        assert_eq!(config.server.port, 6388);
    }

    #[test]
    #[serial]
    fn test_env_override_empty_values_ignored() {
        std::env::set_var("TABSHELL_SSH_HOST", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        std::env::remove_var("TABSHELL_SSH_HOST");
        assert_eq!(config.ssh.host, "localhost");
    }
}
