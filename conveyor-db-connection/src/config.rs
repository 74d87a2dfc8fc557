use std::env::{self, VarError};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::DbConnectionError;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Settings for the SQLite connection pool backing the job store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DbConnectionConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: Option<u64>,
    /// How long a connection waits on a locked database before failing.
    pub busy_timeout_ms: u64,
}

impl Default for DbConnectionConfig {
    #[inline]
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: Some(DEFAULT_IDLE_TIMEOUT_SECS),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl DbConnectionConfig {
    #[inline]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Loads configuration from environment variables using the supplied prefix.
    ///
    /// Expected variables:
    /// - `{PREFIX}_DATABASE_URL` (required)
    /// - `{PREFIX}_DB_MAX_CONNECTIONS` (optional)
    /// - `{PREFIX}_DB_MIN_CONNECTIONS` (optional)
    /// - `{PREFIX}_DB_CONNECT_TIMEOUT_SECS` (optional)
    /// - `{PREFIX}_DB_IDLE_TIMEOUT_SECS` (optional, `0` disables)
    /// - `{PREFIX}_DB_BUSY_TIMEOUT_MS` (optional)
    pub fn from_env(prefix: &str) -> Result<Self, DbConnectionError> {
        let url_var = format!("{prefix}_DATABASE_URL");
        let url = match env::var(&url_var) {
            Ok(url) => url,
            Err(VarError::NotPresent) => return Err(DbConnectionError::MissingEnvVar(url_var)),
            Err(VarError::NotUnicode(_)) => return Err(DbConnectionError::InvalidUnicode(url_var)),
        };

        let mut config = Self::new(url);
        if let Some(max) = env_value(prefix, "DB_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(min) = env_value(prefix, "DB_MIN_CONNECTIONS")? {
            config.min_connections = min;
        }
        if let Some(secs) = env_value(prefix, "DB_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout_secs = secs;
        }
        if let Some(secs) = env_value::<u64>(prefix, "DB_IDLE_TIMEOUT_SECS")? {
            config.idle_timeout_secs = (secs > 0).then_some(secs);
        }
        if let Some(ms) = env_value(prefix, "DB_BUSY_TIMEOUT_MS")? {
            config.busy_timeout_ms = ms;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the URL and pool bounds.
    pub fn validate(&self) -> Result<(), DbConnectionError> {
        if self.url.trim().is_empty() {
            return Err(DbConnectionError::EmptyDatabaseUrl);
        }
        if self.max_connections == 0 {
            return Err(DbConnectionError::InvalidPoolSize(
                "max_connections must be greater than 0".to_owned(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(DbConnectionError::InvalidPoolSize(
                "min_connections must not exceed max_connections".to_owned(),
            ));
        }
        Ok(())
    }

    #[inline]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[inline]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    #[inline]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn env_value<T>(prefix: &str, suffix: &str) -> Result<Option<T>, DbConnectionError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let var = format!("{prefix}_{suffix}");
    match env::var(&var) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse()
                .map(Some)
                .map_err(|e: T::Err| DbConnectionError::InvalidNumber {
                    var,
                    value: trimmed.to_owned(),
                    reason: e.to_string(),
                })
        }
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(DbConnectionError::InvalidUnicode(var)),
    }
}
