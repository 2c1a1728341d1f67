//! Environment-sourced configuration, assembled the way the teacher's `SyncConfig` is built:
//! a `Default` impl plus `with_*` builder methods, with [`Config::from_env`] doing the actual
//! environment parsing on top.

use std::time::Duration;

use crate::executor::config::ExecutorConfig;
use crate::scheduler::config::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub executor: ExecutorConfig,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Loads configuration from the process environment (optionally via a `.env` file,
    /// loaded by the caller with `dotenvy::dotenv()` before this runs).
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingVar("DATABASE_URL"))?;

        let database_max_connections = env_parse_or("DATABASE_MAX_CONNECTIONS", 5)?;
        let tick_interval_secs = env_parse_or("SCHEDULER_TICK_INTERVAL_SECS", 30)?;
        let execution_deadline_secs = env_parse_or("EXECUTION_DEADLINE_SECS", 120)?;
        let job_lock_ttl_secs = env_parse_or("JOB_LOCK_TTL_SECS", 300)?;
        let default_batch_limit = env_parse_or("DEFAULT_BATCH_LIMIT", 500)?;
        let historical_window_fallback_months = std::env::var("HISTORICAL_WINDOW_FALLBACK_MONTHS")
            .unwrap_or_else(|_| "60,12,6,3,1".to_string())
            .split(',')
            .map(|s| s.trim().parse::<u32>().map_err(|_| ConfigError::InvalidVar("HISTORICAL_WINDOW_FALLBACK_MONTHS")))
            .collect::<Result<Vec<u32>, ConfigError>>()?;

        let mut executor = ExecutorConfig::default()
            .with_execution_deadline(Duration::from_secs(execution_deadline_secs))
            .with_default_batch_limit(default_batch_limit)
            .with_historical_window_fallback_months(historical_window_fallback_months)
            .with_job_lock_ttl(chrono::Duration::seconds(job_lock_ttl_secs as i64));
        if let Ok(owner_id) = std::env::var("EXECUTOR_OWNER_ID") {
            executor = executor.with_owner_id(owner_id);
        }

        Ok(Self::default()
            .with_database_url(database_url)
            .with_database_max_connections(database_max_connections)
            .with_executor(executor)
            .with_scheduler(SchedulerConfig::default().with_tick_interval(Duration::from_secs(tick_interval_secs))))
    }

    pub fn with_database_url(mut self, database_url: String) -> Self {
        self.database_url = database_url;
        self
    }

    pub fn with_database_max_connections(mut self, max_connections: u32) -> Self {
        self.database_max_connections = max_connections;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            database_max_connections: 5,
            executor: ExecutorConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

fn env_parse_or<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidVar(var)),
        Err(_) => Ok(default),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable `{0}`")]
    MissingVar(&'static str),

    #[error("invalid value for environment variable `{0}`")]
    InvalidVar(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_fallbacks() {
        let config = Config::default();
        assert_eq!(config.database_max_connections, 5);
        assert_eq!(config.executor.default_batch_limit, 500);
        assert_eq!(config.scheduler.tick_interval, Duration::from_secs(30));
    }

    #[test]
    fn builder_methods_override_defaults() {
        let config = Config::default().with_database_max_connections(20);
        assert_eq!(config.database_max_connections, 20);
    }
}
