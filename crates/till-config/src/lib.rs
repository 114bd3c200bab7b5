//! Agent configuration.
//!
//! One explicit record, parsed from environment variables in `main` and
//! passed into the supervisor at construction. Nothing in the pipeline
//! reads the environment after startup.

use std::time::Duration;

use anyhow::{bail, Context, Result};

pub const ENV_DB_PATH: &str = "TILL_DB_PATH";
pub const ENV_DB_USER: &str = "TILL_DB_USER";
pub const ENV_DB_PASSWORD: &str = "TILL_DB_PASSWORD";
pub const ENV_DB_CHARSET: &str = "TILL_DB_CHARSET";
pub const ENV_WORKERS: &str = "TILL_WORKERS";
pub const ENV_INTAKE_POSITION: &str = "TILL_INTAKE_POSITION";
pub const ENV_QUEUE_CAPACITY: &str = "TILL_QUEUE_CAPACITY";
pub const ENV_POLL_INTERVAL_MS: &str = "TILL_POLL_INTERVAL_MS";
pub const ENV_CLOUD_ENABLED: &str = "TILL_CLOUD_ENABLED";
pub const ENV_CLOUD_ENDPOINT: &str = "TILL_CLOUD_ENDPOINT";
pub const ENV_CLOUD_API_KEY: &str = "TILL_CLOUD_API_KEY";
pub const ENV_BUFFER_PATH: &str = "TILL_BUFFER_PATH";
pub const ENV_BACKGROUND_RETRY: &str = "TILL_BACKGROUND_RETRY";

/// Source-database connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Firebird DSN: either a plain file path for a local server or
    /// `host:/path/to/db.fdb`.
    pub path: String,
    pub user: String,
    pub password: String,
    pub charset: String,
}

/// Intake + worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of processing workers, each with its own DB connection.
    pub count: usize,
    /// First `log_id` the intake cursor considers on startup.
    pub intake_position: i64,
    /// Bound of the in-process change queue (back-pressure point).
    pub queue_capacity: usize,
    /// Intake wake interval when the driver cannot block on events.
    pub poll_interval: Duration,
}

/// Upstream delivery settings.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Master switch; when false the agent only maintains the change log.
    pub enabled: bool,
    pub endpoint: String,
    pub api_key: Option<String>,
    /// SQLite file backing the offline buffer.
    pub buffer_path: String,
    pub background_retry: bool,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub database: DatabaseConfig,
    pub workers: WorkerConfig,
    pub cloud: CloudConfig,
}

impl AgentConfig {
    /// Read the full configuration from the process environment.
    ///
    /// `TILL_DB_PATH` is the only required variable; everything else has a
    /// workable default for a single-host POS deployment.
    pub fn from_env() -> Result<Self> {
        let database = DatabaseConfig {
            path: require(ENV_DB_PATH)?,
            user: var_or(ENV_DB_USER, "sysdba"),
            password: var_or(ENV_DB_PASSWORD, "masterkey"),
            charset: var_or(ENV_DB_CHARSET, "UTF8"),
        };

        let workers = WorkerConfig {
            count: parse_or(ENV_WORKERS, 10)?,
            intake_position: parse_or(ENV_INTAKE_POSITION, 0)?,
            queue_capacity: parse_or(ENV_QUEUE_CAPACITY, 256)?,
            poll_interval: Duration::from_millis(parse_or(ENV_POLL_INTERVAL_MS, 1000)?),
        };

        let cloud = CloudConfig {
            enabled: parse_bool_or(ENV_CLOUD_ENABLED, true)?,
            endpoint: var_or(ENV_CLOUD_ENDPOINT, "http://localhost:8080/api/changes"),
            api_key: std::env::var(ENV_CLOUD_API_KEY).ok().filter(|s| !s.is_empty()),
            buffer_path: var_or(ENV_BUFFER_PATH, "till_buffer.db"),
            background_retry: parse_bool_or(ENV_BACKGROUND_RETRY, true)?,
        };

        Ok(Self {
            database,
            workers,
            cloud,
        })
    }
}

fn require(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("missing env var {name}"))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn parse_bool_or(name: &str, default: bool) -> Result<bool> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => bail!("invalid value for {name}: {raw:?} (expected true/false)"),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; keep them in one test so they
    // cannot race each other under the parallel test runner.
    #[test]
    fn from_env_defaults_and_overrides() {
        std::env::set_var(ENV_DB_PATH, "C:/pos/data.fdb");
        std::env::set_var(ENV_WORKERS, "4");
        std::env::set_var(ENV_BACKGROUND_RETRY, "off");
        std::env::remove_var(ENV_CLOUD_API_KEY);

        let cfg = AgentConfig::from_env().unwrap();
        assert_eq!(cfg.database.path, "C:/pos/data.fdb");
        assert_eq!(cfg.database.user, "sysdba");
        assert_eq!(cfg.workers.count, 4);
        assert_eq!(cfg.workers.intake_position, 0);
        assert_eq!(cfg.workers.poll_interval, Duration::from_millis(1000));
        assert!(cfg.cloud.enabled);
        assert!(!cfg.cloud.background_retry);
        assert_eq!(cfg.cloud.api_key, None);

        std::env::set_var(ENV_WORKERS, "not-a-number");
        assert!(AgentConfig::from_env().is_err());

        std::env::remove_var(ENV_DB_PATH);
        std::env::remove_var(ENV_WORKERS);
        std::env::remove_var(ENV_BACKGROUND_RETRY);
        assert!(AgentConfig::from_env().is_err());
    }
}
