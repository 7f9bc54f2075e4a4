use std::{env, time::Duration};

use serde::{Deserialize, Serialize};

/// Server and engine configuration, environment-overridable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// SQLite URL; defaults to a file in the asset directory when unset.
    pub database_url: Option<String>,
    /// Wall-clock budget for a single run before it is cancelled with
    /// terminal status `timeout`.
    pub run_timeout_secs: u64,
    /// Retention TTL for run events of terminal runs.
    pub event_ttl_secs: u64,
    pub retention_interval_secs: u64,
    /// Fan-out channel depth per run; slow subscribers beyond this resync
    /// from the event log.
    pub broker_capacity: usize,
    pub broker_max_age_secs: u64,
    /// Poll cadence for joining a run with no local handle.
    pub join_poll_interval_ms: u64,
    pub join_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            database_url: None,
            run_timeout_secs: 3600,
            event_ttl_secs: 86_400,
            retention_interval_secs: 300,
            broker_capacity: 256,
            broker_max_age_secs: 3600,
            join_poll_interval_ms: 500,
            join_timeout_secs: 300,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_or("HOST", defaults.host),
            port: env_or("PORT", defaults.port),
            database_url: env::var("DATABASE_URL").ok(),
            run_timeout_secs: env_or("RUN_TIMEOUT_SECS", defaults.run_timeout_secs),
            event_ttl_secs: env_or("EVENT_TTL_SECS", defaults.event_ttl_secs),
            retention_interval_secs: env_or(
                "RETENTION_INTERVAL_SECS",
                defaults.retention_interval_secs,
            ),
            broker_capacity: env_or("BROKER_CAPACITY", defaults.broker_capacity),
            broker_max_age_secs: env_or("BROKER_MAX_AGE_SECS", defaults.broker_max_age_secs),
            join_poll_interval_ms: env_or("JOIN_POLL_INTERVAL_MS", defaults.join_poll_interval_ms),
            join_timeout_secs: env_or("JOIN_TIMEOUT_SECS", defaults.join_timeout_secs),
        }
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn event_ttl(&self) -> Duration {
        Duration::from_secs(self.event_ttl_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }

    pub fn broker_max_age(&self) -> Duration {
        Duration::from_secs(self.broker_max_age_secs)
    }

    pub fn join_poll_interval(&self) -> Duration {
        Duration::from_millis(self.join_poll_interval_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("invalid value for {key}, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.port, 8000);
        assert_eq!(config.run_timeout(), Duration::from_secs(3600));
        assert_eq!(config.join_poll_interval(), Duration::from_millis(500));
    }
}
