//! Configuration management for the restore tool.
//!
//! Loads configuration from a TOML file, then lets `SQL_RESTORE_*`
//! environment variables (optionally from a `.env` file) override single
//! fields.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::db::ConnectParams;
use crate::restore::RestoreSettings;
use crate::utils::RestoreError;

pub const ENV_PREFIX: &str = "SQL_RESTORE_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Client driver family
    #[serde(default = "default_driver")]
    pub driver: String,

    /// ODBC driver name, part of the connection identity
    #[serde(default = "default_odbc_driver")]
    pub odbc_driver: String,

    /// `host`, `host,port` or `host\instance`
    #[serde(default)]
    pub server: String,

    #[serde(default)]
    pub trusted_connection: bool,

    #[serde(default)]
    pub username: String,

    /// Base64-obscured password
    #[serde(default)]
    pub password: String,

    /// Login timeout in seconds (0 disables it)
    #[serde(default = "default_login_timeout")]
    pub login_timeout: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Backup directory as seen by this machine
    #[serde(default)]
    pub local_path: String,

    /// The same directory as seen by the SQL server
    #[serde(default)]
    pub remote_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_driver() -> String {
    "tds".to_string()
}

fn default_odbc_driver() -> String {
    "ODBC Driver 17 for SQL Server".to_string()
}

fn default_login_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            odbc_driver: default_odbc_driver(),
            server: String::new(),
            trusted_connection: false,
            username: String::new(),
            password: String::new(),
            login_timeout: default_login_timeout(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            paths: PathsConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Unable to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// File (or defaults), then `.env`, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let _ = dotenvy::dotenv();
        config.apply_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok());
        Ok(config)
    }

    /// Override fields from `lookup`, which receives the variable name
    /// without the `SQL_RESTORE_` prefix.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SERVER") {
            self.server.server = v;
        }
        if let Some(v) = lookup("USERNAME") {
            self.server.username = v;
        }
        if let Some(v) = lookup("PASSWORD") {
            self.server.password = v;
        }
        if let Some(v) = lookup("TRUSTED_CONNECTION") {
            self.server.trusted_connection = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = lookup("LOGIN_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.server.login_timeout = v;
        }
        if let Some(v) = lookup("LOCAL_PATH") {
            self.paths.local_path = v;
        }
        if let Some(v) = lookup("REMOTE_PATH") {
            self.paths.remote_path = v;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log.level = v;
        }
    }

    /// Decoded password.
    pub fn password(&self) -> std::result::Result<String, RestoreError> {
        if self.server.password.is_empty() {
            return Ok(String::new());
        }
        let bytes = STANDARD
            .decode(self.server.password.trim())
            .map_err(|_| RestoreError::Configuration("SQL password is not valid base64".to_string()))?;
        String::from_utf8(bytes)
            .map_err(|_| RestoreError::Configuration("SQL password is not valid UTF-8".to_string()))
    }

    /// Obscure a plain password for storage in the config file.
    pub fn encode_password(plain: &str) -> String {
        STANDARD.encode(plain.as_bytes())
    }

    pub fn connect_params(&self) -> std::result::Result<ConnectParams, RestoreError> {
        Ok(ConnectParams {
            driver: self.server.driver.clone(),
            odbc_driver: self.server.odbc_driver.clone(),
            server: self.server.server.clone(),
            trusted_connection: self.server.trusted_connection,
            username: self.server.username.clone(),
            password: self.password()?,
            login_timeout: self.server.login_timeout,
        })
    }

    pub fn restore_settings(&self) -> std::result::Result<RestoreSettings, RestoreError> {
        Ok(RestoreSettings {
            local_path: self.paths.local_path.clone(),
            remote_path: self.paths.remote_path.clone(),
            connection: self.connect_params()?,
        })
    }
}
