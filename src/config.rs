//! Startup configuration parsed from environment variables.
//!
//! SYSTEM CONTEXT
//! ==============
//! The entry point loads `.env` with `dotenvy`, then parses the process
//! environment into an `AppConfig` before any connection attempt. A missing
//! required variable aborts startup here, never later.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::logging::{DEFAULT_LOG_BACKUPS, DEFAULT_LOG_MAX_BYTES, LogLevel, LogRotation};

pub const DEFAULT_DB_PORT: u16 = 5432;
pub const DEFAULT_POOL_SIZE: u32 = 10;
pub const DEFAULT_MAX_OVERFLOW: u32 = 20;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SEED_DIR: &str = "seed_data";

/// Timezone forced on every pooled connection at the protocol level.
pub const SESSION_TIMEZONE: &str = "UTC";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} not found in environment")]
    Missing { var: &'static str },
    #[error("invalid {var} value '{value}': {reason}")]
    Invalid { var: &'static str, value: String, reason: String },
}

/// Deployment environment tag taken from `APP_ENV`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEnv {
    Prod,
    Other(String),
}

impl AppEnv {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw == "prod" { Self::Prod } else { Self::Other(raw.to_owned()) }
    }

    #[must_use]
    pub fn is_prod(&self) -> bool {
        matches!(self, Self::Prod)
    }
}

impl fmt::Display for AppEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prod => f.write_str("prod"),
            Self::Other(tag) => f.write_str(tag),
        }
    }
}

/// Validated database connection parameters.
///
/// Fields are private so a constructed value cannot be altered; the only way
/// to obtain one is through [`ConnectionConfig::new`] or [`AppConfig::from_env`].
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    host: String,
    port: u16,
    database: String,
    user: String,
    password: String,
    pool_size: u32,
    max_overflow: u32,
    acquire_timeout: Duration,
    query_timeout: Duration,
}

impl ConnectionConfig {
    /// Build a config with default port, pool bounds and timeouts.
    ///
    /// Only the host is trimmed. Database, user and password are kept exactly
    /// as given, since surrounding whitespace can be part of a credential.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if any of the four parameters is empty
    /// or whitespace-only.
    pub fn new(host: &str, database: &str, user: &str, password: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            host: required_value("DB_HOST", host)?.trim().to_owned(),
            port: DEFAULT_DB_PORT,
            database: required_value("DB_NAME", database)?,
            user: required_value("DB_USER", user)?,
            password: required_value("DB_PASSWORD", password)?,
            pool_size: DEFAULT_POOL_SIZE,
            max_overflow: DEFAULT_MAX_OVERFLOW,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
        })
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_pool(mut self, pool_size: u32, max_overflow: u32) -> Self {
        self.pool_size = pool_size;
        self.max_overflow = max_overflow;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, acquire: Duration, query: Duration) -> Self {
        self.acquire_timeout = acquire;
        self.query_timeout = query;
        self
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Connections kept warm in the pool.
    #[must_use]
    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    /// Extra connections allowed above `pool_size` under load.
    #[must_use]
    pub fn max_overflow(&self) -> u32 {
        self.max_overflow
    }

    /// Hard upper bound on open connections.
    #[must_use]
    pub fn max_connections(&self) -> u32 {
        self.pool_size.saturating_add(self.max_overflow)
    }

    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    #[must_use]
    pub fn timezone(&self) -> &'static str {
        SESSION_TIMEZONE
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("pool_size", &self.pool_size)
            .field("max_overflow", &self.max_overflow)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database: ConnectionConfig,
    pub log_level: LogLevel,
    pub app_env: AppEnv,
    /// Directory override for the log file; `None` picks the env default.
    pub log_dir: Option<PathBuf>,
    pub log_rotation: LogRotation,
    pub seed_dir: PathBuf,
}

impl AppConfig {
    /// Build typed config from the process environment.
    ///
    /// Required:
    /// - `DB_HOST`, `DB_NAME`, `DB_USER`, `DB_PASSWORD`
    /// - `LOG_LEVEL`: name (`info`) or numeric level (`20`)
    /// - `APP_ENV`: `prod` or any other tag
    ///
    /// Optional:
    /// - `DB_PORT`: default 5432
    /// - `DB_POOL_SIZE`: default 10
    /// - `DB_MAX_OVERFLOW`: default 20
    /// - `DB_ACQUIRE_TIMEOUT_SECS`: default 30
    /// - `DB_QUERY_TIMEOUT_SECS`: default 10
    /// - `LOG_DIR`: log directory override
    /// - `LOG_MAX_BYTES`: rotate `infra.log` at this size, default 500000
    /// - `LOG_BACKUP_COUNT`: rotated files kept, default 5
    /// - `SEED_DIR`: default `seed_data`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or any value
    /// fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::from_env`], reading values through `lookup`.
    ///
    /// # Errors
    ///
    /// See [`AppConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = required(&lookup, "DB_HOST")?;
        let database = required(&lookup, "DB_NAME")?;
        let user = required(&lookup, "DB_USER")?;
        let password = required(&lookup, "DB_PASSWORD")?;
        let log_level_raw = required(&lookup, "LOG_LEVEL")?;
        let app_env = AppEnv::parse(required(&lookup, "APP_ENV")?.trim());

        let log_level = log_level_raw.parse::<LogLevel>().map_err(|reason| ConfigError::Invalid {
            var: "LOG_LEVEL",
            value: log_level_raw.clone(),
            reason,
        })?;

        let port = optional_parse(&lookup, "DB_PORT", DEFAULT_DB_PORT)?;
        let pool_size = optional_parse(&lookup, "DB_POOL_SIZE", DEFAULT_POOL_SIZE)?;
        let max_overflow = optional_parse(&lookup, "DB_MAX_OVERFLOW", DEFAULT_MAX_OVERFLOW)?;
        let acquire_secs = optional_parse(&lookup, "DB_ACQUIRE_TIMEOUT_SECS", DEFAULT_ACQUIRE_TIMEOUT_SECS)?;
        let query_secs = optional_parse(&lookup, "DB_QUERY_TIMEOUT_SECS", DEFAULT_QUERY_TIMEOUT_SECS)?;
        let log_max_bytes = optional_parse(&lookup, "LOG_MAX_BYTES", DEFAULT_LOG_MAX_BYTES)?;
        let log_backups = optional_parse(&lookup, "LOG_BACKUP_COUNT", DEFAULT_LOG_BACKUPS)?;

        if port == 0 {
            return Err(invalid("DB_PORT", "0", "port must be non-zero"));
        }
        if pool_size == 0 {
            return Err(invalid("DB_POOL_SIZE", "0", "pool size must be at least 1"));
        }
        if log_max_bytes == 0 {
            return Err(invalid("LOG_MAX_BYTES", "0", "log size limit must be non-zero"));
        }

        let database = ConnectionConfig::new(&host, &database, &user, &password)?
            .with_port(port)
            .with_pool(pool_size, max_overflow)
            .with_timeouts(Duration::from_secs(acquire_secs), Duration::from_secs(query_secs));

        let log_dir = lookup("LOG_DIR").filter(|v| !v.trim().is_empty()).map(PathBuf::from);
        let seed_dir = lookup("SEED_DIR")
            .filter(|v| !v.trim().is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_SEED_DIR), PathBuf::from);

        let log_rotation = LogRotation { max_bytes: log_max_bytes, backups: log_backups };

        Ok(Self { database, log_level, app_env, log_dir, log_rotation, seed_dir })
    }
}

fn required<F>(lookup: &F, var: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    required_value(var, lookup(var).as_deref().unwrap_or_default())
}

/// `raw` unchanged, unless it is empty or whitespace-only.
fn required_value(var: &'static str, raw: &str) -> Result<String, ConfigError> {
    if raw.trim().is_empty() {
        return Err(ConfigError::Missing { var });
    }
    Ok(raw.to_owned())
}

fn optional_parse<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| invalid(var, &raw, &e.to_string())),
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { var, value: value.to_owned(), reason: reason.to_owned() }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
