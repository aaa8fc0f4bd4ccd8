//! Store configuration.
//!
//! Loaded from JSON (the adapter's option object) or from the environment.
//! Every field has a default, so `{}` is a complete configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use graphstore_core::{DomainError, TablePrefix};

use crate::jobs::RetryPolicy;

/// Errors raised while loading configuration or configuring the adapter.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error("invalid value for {key}: {message}")]
    Value { key: String, message: String },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid connection settings: {0}")]
    Connection(String),

    #[error("schema setup failed: {0}")]
    Schema(String),

    #[error("adapter is already configured")]
    AlreadyConfigured,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Full connection URL. Takes precedence over the discrete fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            database: "graph_store".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_ms: 30_000,
        }
    }
}

impl PoolSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Retry settings applied to each node write in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_delay_ms: 1000,
        }
    }
}

impl JobSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.max_attempts.max(1), Duration::from_millis(self.retry_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub connection: ConnectionSettings,
    /// Table prefix; the value table is `{table}_val`.
    pub table: String,
    pub pool: PoolSettings,
    pub jobs: JobSettings,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            table: "graph_store".to_string(),
            pool: PoolSettings::default(),
            jobs: JobSettings::default(),
        }
    }
}

impl StoreConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.table_prefix()?;
        Ok(config)
    }

    /// Load from process environment variables.
    ///
    /// - `DATABASE_URL`
    /// - `GRAPH_STORE_TABLE`
    /// - `GRAPH_STORE_MAX_CONNECTIONS`
    /// - `GRAPH_STORE_ACQUIRE_TIMEOUT_MS`
    /// - `GRAPH_STORE_JOB_MAX_ATTEMPTS`
    /// - `GRAPH_STORE_JOB_RETRY_DELAY_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`StoreConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("DATABASE_URL") {
            config.connection.url = Some(url);
        }
        if let Some(table) = lookup("GRAPH_STORE_TABLE") {
            config.table = table;
        }
        if let Some(raw) = lookup("GRAPH_STORE_MAX_CONNECTIONS") {
            config.pool.max_connections = parse_var("GRAPH_STORE_MAX_CONNECTIONS", &raw)?;
        }
        if let Some(raw) = lookup("GRAPH_STORE_ACQUIRE_TIMEOUT_MS") {
            config.pool.acquire_timeout_ms = parse_var("GRAPH_STORE_ACQUIRE_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("GRAPH_STORE_JOB_MAX_ATTEMPTS") {
            config.jobs.max_attempts = parse_var("GRAPH_STORE_JOB_MAX_ATTEMPTS", &raw)?;
        }
        if let Some(raw) = lookup("GRAPH_STORE_JOB_RETRY_DELAY_MS") {
            config.jobs.retry_delay_ms = parse_var("GRAPH_STORE_JOB_RETRY_DELAY_MS", &raw)?;
        }

        config.table_prefix()?;
        Ok(config)
    }

    pub fn table_prefix(&self) -> Result<TablePrefix, ConfigError> {
        Ok(TablePrefix::parse(&self.table)?)
    }
}

fn parse_var<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Value {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Options handed to the adapter by its host.
///
/// Without a `store` section the adapter stays uninitialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterOptions {
    pub store: Option<StoreConfig>,
}

impl AdapterOptions {
    pub fn with_store(store: StoreConfig) -> Self {
        Self { store: Some(store) }
    }
}
