//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Environment (development, production)
    pub environment: String,

    /// Posting worker tasks
    pub worker_concurrency: usize,

    /// Idle wait between empty queue polls
    pub worker_poll_interval: Duration,

    /// How long a claimed job stays invisible to other workers
    pub job_visibility_timeout: Duration,

    /// Deliveries per job, and posting attempts per document for scheduled retry
    pub job_max_attempts: u32,

    /// Base delay of the exponential retry backoff
    pub retry_base_delay: Duration,

    /// Processing documents older than this are failed by the scheduler
    pub stale_processing_after: Duration,

    /// Completed jobs kept this long
    pub completed_job_retention: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError::MissingEnv("DATABASE_URL"))?;

        let database_max_connections = parse_var("DATABASE_MAX_CONNECTIONS", 10)?;

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = parse_var("PORT", 3000)?;

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let worker_concurrency = parse_var("WORKER_CONCURRENCY", 4usize)?;
        if worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue("WORKER_CONCURRENCY"));
        }

        let job_max_attempts = parse_var("JOB_MAX_ATTEMPTS", 5u32)?;
        if job_max_attempts == 0 {
            return Err(ConfigError::InvalidValue("JOB_MAX_ATTEMPTS"));
        }

        Ok(Self {
            database_url,
            database_max_connections,
            host,
            port,
            environment,
            worker_concurrency,
            worker_poll_interval: Duration::from_millis(parse_var("WORKER_POLL_INTERVAL_MS", 500)?),
            job_visibility_timeout: Duration::from_secs(parse_var(
                "JOB_VISIBILITY_TIMEOUT_SECS",
                60,
            )?),
            job_max_attempts,
            retry_base_delay: Duration::from_millis(parse_var("RETRY_BASE_DELAY_MS", 1000)?),
            stale_processing_after: Duration::from_secs(parse_var("STALE_PROCESSING_SECS", 300)?),
            completed_job_retention: Duration::from_secs(
                parse_var::<u64>("COMPLETED_JOB_RETENTION_HOURS", 72)? * 3600,
            ),
        })
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Parse an optional variable, falling back to `default` when unset
fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue(name)),
        Err(_) => Ok(default),
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
