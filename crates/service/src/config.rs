//! Process configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use fieldops_observability::LogFormat;

pub const BUS_URL: &str = "FIELDOPS_BUS_URL";
pub const DATABASE_URL: &str = "FIELDOPS_DATABASE_URL";
pub const HTTP_ADDR: &str = "FIELDOPS_HTTP_ADDR";
pub const TENANT: &str = "FIELDOPS_TENANT";
pub const FEATURES: &str = "FIELDOPS_FEATURES";
pub const SHUTDOWN_GRACE_SECS: &str = "FIELDOPS_SHUTDOWN_GRACE_SECS";
pub const LOG_FORMAT: &str = "FIELDOPS_LOG_FORMAT";

const DEFAULT_BUS_URL: &str = "mem://events";
const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}': {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Topic URL the listener subscribes to.
    pub bus_url: String,
    /// Base Postgres URL; tenant databases are in-memory when unset.
    pub database_url: Option<String>,
    pub http_addr: SocketAddr,
    /// Only process messages of this tenant.
    pub tenant: Option<String>,
    /// Feature flags granted to the automation identity.
    pub features: Vec<String>,
    pub shutdown_grace: Duration,
    pub log_format: LogFormat,
}

impl ServiceConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default        |
    /// |--------------------------------|----------------|
    /// | `FIELDOPS_BUS_URL`             | `mem://events` |
    /// | `FIELDOPS_DATABASE_URL`        | unset          |
    /// | `FIELDOPS_HTTP_ADDR`           | `0.0.0.0:8080` |
    /// | `FIELDOPS_TENANT`              | unset          |
    /// | `FIELDOPS_FEATURES`            | empty          |
    /// | `FIELDOPS_SHUTDOWN_GRACE_SECS` | `10`           |
    /// | `FIELDOPS_LOG_FORMAT`          | `json`         |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through `lookup`; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bus_url = get(BUS_URL).unwrap_or_else(|| DEFAULT_BUS_URL.to_string());

        let http_addr = get(HTTP_ADDR).unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string());
        let http_addr = http_addr
            .parse::<SocketAddr>()
            .map_err(|e| invalid(HTTP_ADDR, &http_addr, e))?;

        let features = get(FEATURES)
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let shutdown_grace_secs = match get(SHUTDOWN_GRACE_SECS) {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|e| invalid(SHUTDOWN_GRACE_SECS, &raw, e))?,
            None => DEFAULT_SHUTDOWN_GRACE_SECS,
        };

        let log_format = match get(LOG_FORMAT) {
            Some(raw) => raw.parse::<LogFormat>().map_err(|e| invalid(LOG_FORMAT, &raw, e))?,
            None => LogFormat::default(),
        };

        Ok(Self {
            bus_url,
            database_url: get(DATABASE_URL),
            http_addr,
            tenant: get(TENANT),
            features,
            shutdown_grace: Duration::from_secs(shutdown_grace_secs),
            log_format,
        })
    }
}

fn invalid(var: &'static str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
