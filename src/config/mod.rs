//! Configuration management for the stepwise history engine
//!
//! Handles database connection settings and cooperative lock tuning.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Cooperative lock configuration
    pub lock: LockConfig,
}

/// SQLite database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL (e.g., "sqlite://data/stepwise.db")
    pub url: String,
    /// Upper bound on pooled connections
    pub max_connections: u32,
}

/// Per-workflow lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long an editor waits for a workflow's lock before giving up.
    /// A holder that stalls past this is treated as a fault, never retried.
    pub timeout_ms: u64,
}

impl Config {
    /// Lock acquisition timeout as a `Duration`
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock.timeout_ms)
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR overrides for container deployment
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: std::env::var("STEPWISE_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/stepwise.db".to_string()),
                max_connections: std::env::var("STEPWISE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            },
            lock: LockConfig {
                timeout_ms: std::env::var("STEPWISE_LOCK_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5000),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_is_milliseconds() {
        let config = Config {
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
                max_connections: 1,
            },
            lock: LockConfig { timeout_ms: 250 },
        };
        assert_eq!(config.lock_timeout(), Duration::from_millis(250));
    }
}
