//! Service configuration for the leaseq worker binary.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use leaseq_core::{storage::postgres, TopicSet};
use leaseq_worker::WorkerConfig;
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "leaseq.toml";

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`leaseq.toml`)
/// 3. Built-in defaults (lowest priority)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,
    /// Table holding queue records.
    ///
    /// Environment variable: `QUEUE_TABLE`
    #[serde(default = "default_queue_table", alias = "QUEUE_TABLE")]
    pub queue_table: String,

    // Worker
    /// Delay between claim scans in milliseconds.
    ///
    /// Environment variable: `POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms", alias = "POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,
    /// Lease lifetime without a heartbeat in milliseconds.
    ///
    /// Environment variable: `LEASE_LIFETIME_MS`
    #[serde(default = "default_lease_lifetime_ms", alias = "LEASE_LIFETIME_MS")]
    pub lease_lifetime_ms: u64,
    /// Delay between stale-lease reclaim passes in milliseconds.
    ///
    /// Environment variable: `RECLAIM_INTERVAL_MS`
    #[serde(default = "default_reclaim_interval_ms", alias = "RECLAIM_INTERVAL_MS")]
    pub reclaim_interval_ms: u64,
    /// Topics to claim in addition to untagged records, e.g. `[billing, mail]`.
    ///
    /// Environment variable: `TOPICS`
    #[serde(default, alias = "TOPICS")]
    pub topics: Vec<String>,
    /// Upper bound on insert/flag cycles per send.
    ///
    /// Environment variable: `MAX_SEND_CYCLES`
    #[serde(default = "default_max_send_cycles", alias = "MAX_SEND_CYCLES")]
    pub max_send_cycles: u32,
    /// Seconds to wait for loops to stop on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Logging
    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the worker crate's configuration.
    pub fn to_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease_lifetime: Duration::from_millis(self.lease_lifetime_ms),
            reclaim_interval: Duration::from_millis(self.reclaim_interval_ms),
            topics: self.topics.iter().cloned().collect::<TopicSet>(),
            max_send_cycles: self.max_send_cycles,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_seconds),
            ..WorkerConfig::default()
        }
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        let start = self.database_url.find("://").map_or(0, |pos| pos + 3);
        let authority = &self.database_url[start..];
        if let Some(at_pos) = authority.find('@') {
            if let Some(colon_pos) = authority[..at_pos].find(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(start + colon_pos + 1..start + at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        postgres::validate_table_name(&self.queue_table).context("invalid queue_table")?;

        if self.lease_lifetime_ms <= self.poll_interval_ms {
            tracing::warn!(
                lease_lifetime_ms = self.lease_lifetime_ms,
                poll_interval_ms = self.poll_interval_ms,
                "lease lifetime is not longer than the poll interval"
            );
        }

        self.to_worker_config().validate().context("invalid worker settings")?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            queue_table: default_queue_table(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_lifetime_ms: default_lease_lifetime_ms(),
            reclaim_interval_ms: default_reclaim_interval_ms(),
            topics: Vec::new(),
            max_send_cycles: default_max_send_cycles(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/leaseq".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_queue_table() -> String {
    postgres::DEFAULT_TABLE.to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_lease_lifetime_ms() -> u64 {
    60_000
}

fn default_reclaim_interval_ms() -> u64 {
    15_000
}

fn default_max_send_cycles() -> u32 {
    leaseq_worker::DEFAULT_MAX_SEND_CYCLES
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info,leaseq=debug".to_string()
}
