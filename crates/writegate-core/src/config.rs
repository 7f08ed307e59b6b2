//! Runtime configuration.
//!
//! Sources, later ones win: built-in defaults, an optional YAML file, then
//! `WRITEGATE_*` environment variables. A malformed environment value is an
//! error rather than being ignored. [`RuntimeConfig::validate`] runs once at
//! the end of loading.

use crate::nonce::DEFAULT_NONCE_SCOPE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const ENV_DB_PATH: &str = "WRITEGATE_DB_PATH";
pub const ENV_BUSY_TIMEOUT_MS: &str = "WRITEGATE_DB_BUSY_TIMEOUT_MS";
pub const ENV_NODE_NAME: &str = "WRITEGATE_NODE_NAME";
pub const ENV_NONCE_SCOPE: &str = "WRITEGATE_NONCE_SCOPE";
pub const ENV_NONCE_WINDOW: &str = "WRITEGATE_NONCE_WINDOW";
pub const ENV_IDEMPOTENCY_TTL_SECS: &str = "WRITEGATE_IDEMPOTENCY_TTL_SECS";
pub const ENV_WRITE_TIMEOUT_MS: &str = "WRITEGATE_WRITE_TIMEOUT_MS";
pub const ENV_RATE_LIMIT_PER_MINUTE: &str = "WRITEGATE_RATE_LIMIT_PER_MINUTE";
pub const ENV_RATE_LIMIT_BURST: &str = "WRITEGATE_RATE_LIMIT_BURST";
pub const ENV_TRUST_PROXY_HEADERS: &str = "WRITEGATE_TRUST_PROXY_HEADERS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub db_path: PathBuf,
    pub busy_timeout_ms: u64,
    pub node_name: String,
    pub nonce_scope: String,
    pub nonce_window: u64,
    pub idempotency_ttl_secs: u64,
    pub write_timeout_ms: u64,
    pub rate_limit_per_minute: u32,
    pub rate_limit_burst: u32,
    pub trust_proxy_headers: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("writegate.db"),
            busy_timeout_ms: 5000,
            node_name: "platform-node".to_string(),
            nonce_scope: DEFAULT_NONCE_SCOPE.to_string(),
            nonce_window: 1000,
            idempotency_ttl_secs: 24 * 60 * 60,
            write_timeout_ms: 8000,
            rate_limit_per_minute: 120,
            rate_limit_burst: 30,
            trust_proxy_headers: true,
        }
    }
}

impl RuntimeConfig {
    /// Defaults, then `path` (if given), then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        cfg.apply_env_from(|var| std::env::var(var).ok())?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Parse a YAML file. Missing fields take their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&raw).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })
    }

    /// Override fields from `lookup(var)`. Blank values are treated as unset.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &'static str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (var, v))
        };

        if let Some((_, v)) = get(ENV_DB_PATH) {
            self.db_path = PathBuf::from(v);
        }
        if let Some((var, v)) = get(ENV_BUSY_TIMEOUT_MS) {
            self.busy_timeout_ms = parse_number(var, &v)?;
        }
        if let Some((_, v)) = get(ENV_NODE_NAME) {
            self.node_name = v;
        }
        if let Some((_, v)) = get(ENV_NONCE_SCOPE) {
            self.nonce_scope = v;
        }
        if let Some((var, v)) = get(ENV_NONCE_WINDOW) {
            self.nonce_window = parse_number(var, &v)?;
        }
        if let Some((var, v)) = get(ENV_IDEMPOTENCY_TTL_SECS) {
            self.idempotency_ttl_secs = parse_number(var, &v)?;
        }
        if let Some((var, v)) = get(ENV_WRITE_TIMEOUT_MS) {
            self.write_timeout_ms = parse_number(var, &v)?;
        }
        if let Some((var, v)) = get(ENV_RATE_LIMIT_PER_MINUTE) {
            self.rate_limit_per_minute = parse_number(var, &v)?;
        }
        if let Some((var, v)) = get(ENV_RATE_LIMIT_BURST) {
            self.rate_limit_burst = parse_number(var, &v)?;
        }
        if let Some((var, v)) = get(ENV_TRUST_PROXY_HEADERS) {
            self.trust_proxy_headers = parse_bool(var, &v)?;
        }
        Ok(())
    }

    /// Trim identifiers; a blank nonce scope becomes the default scope.
    pub fn normalize(&mut self) {
        self.node_name = self.node_name.trim().to_string();
        self.nonce_scope = match self.nonce_scope.trim() {
            "" => DEFAULT_NONCE_SCOPE.to_string(),
            s => s.to_string(),
        };
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("db_path is required".into()));
        }
        if self.node_name.trim().is_empty() {
            return Err(ConfigError::Invalid("node_name is required".into()));
        }
        if self.busy_timeout_ms == 0 {
            return Err(ConfigError::Invalid("busy_timeout_ms must be > 0".into()));
        }
        if self.nonce_window == 0 {
            return Err(ConfigError::Invalid("nonce_window must be > 0".into()));
        }
        if self.nonce_window > i64::MAX as u64 {
            return Err(ConfigError::Invalid("nonce_window is too large".into()));
        }
        if self.idempotency_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "idempotency_ttl_secs must be > 0".into(),
            ));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid("write_timeout_ms must be > 0".into()));
        }
        if self.rate_limit_per_minute == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit_per_minute must be > 0".into(),
            ));
        }
        if self.rate_limit_burst > self.rate_limit_per_minute {
            return Err(ConfigError::Invalid(format!(
                "rate_limit_burst ({}) must not exceed rate_limit_per_minute ({})",
                self.rate_limit_burst, self.rate_limit_per_minute
            )));
        }
        Ok(())
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

fn parse_number<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
