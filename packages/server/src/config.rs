use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

use crate::optimize::ControllerConfig;
use crate::scheduler::SchedulerConfig;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Postgres URL for the config store; absent runs the in-memory store.
    pub database_url: Option<String>,
    pub tick_interval_ms: u64,
    pub watchdog_interval_secs: u64,
    pub shutdown_grace_secs: u64,
    /// How long a job may wait for explicitly requested clients.
    pub max_client_wait_secs: u64,
    pub recently_completed_capacity: usize,
    /// Honor the legacy `"one"` spelling as a truthy operator flag.
    pub accept_one_as_truthy: bool,
    /// Treat an explicit re-run duration of zero as "use template duration".
    pub rerun_zero_means_template: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            tick_interval_ms: 1_000,
            watchdog_interval_secs: 30,
            shutdown_grace_secs: 10,
            max_client_wait_secs: 300,
            recently_completed_capacity: 10,
            accept_one_as_truthy: false,
            rerun_zero_means_template: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        Ok(Self {
            database_url: env::var("DATABASE_URL").ok(),
            tick_interval_ms: parse_var("SWARM_TICK_INTERVAL_MS", defaults.tick_interval_ms)?,
            watchdog_interval_secs: parse_var(
                "SWARM_WATCHDOG_INTERVAL_SECS",
                defaults.watchdog_interval_secs,
            )?,
            shutdown_grace_secs: parse_var(
                "SWARM_SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace_secs,
            )?,
            max_client_wait_secs: parse_var(
                "SWARM_MAX_CLIENT_WAIT_SECS",
                defaults.max_client_wait_secs,
            )?,
            recently_completed_capacity: parse_var(
                "SWARM_RECENT_CAPACITY",
                defaults.recently_completed_capacity,
            )?,
            accept_one_as_truthy: flag_var("SWARM_ACCEPT_ONE_AS_TRUTHY"),
            rerun_zero_means_template: flag_var("SWARM_RERUN_ZERO_MEANS_TEMPLATE"),
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            max_client_wait: Duration::from_secs(self.max_client_wait_secs),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            recently_completed_capacity: self.recently_completed_capacity,
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            rerun_zero_means_template: self.rerun_zero_means_template,
        }
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

fn flag_var(name: &str) -> bool {
    env::var(name)
        .map(|raw| crate::common::input::parse_flag(&raw, false))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.tick_interval_ms, 1_000);
        assert_eq!(config.watchdog_interval_secs, 30);
        assert_eq!(config.recently_completed_capacity, 10);
        assert!(!config.accept_one_as_truthy);
    }

    #[test]
    fn scheduler_config_converts_units() {
        let config = ServerConfig {
            tick_interval_ms: 250,
            shutdown_grace_secs: 3,
            ..Default::default()
        };
        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.tick_interval, Duration::from_millis(250));
        assert_eq!(scheduler.shutdown_grace, Duration::from_secs(3));
    }
}
