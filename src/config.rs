//! # Configuration
//!
//! Environment-driven configuration for the background-execution subsystem.
//! Each section carries sensible defaults and can be overridden through
//! `CARDMAKER_*` environment variables (the backend address follows the
//! conventional `REDIS_URL`).

use std::str::FromStr;
use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::resilience::CircuitBreakerConfig;

/// Complete configuration surface recognized by the subsystem.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub backend: BackendConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub cache: CacheConfig,
    pub tasks: TaskConfig,
    pub worker: WorkerConfig,
}

/// Connection settings for the shared networked backend (cache + broker).
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Backend address. `None` disables the networked paths entirely and the
    /// subsystem runs on its in-process fallbacks.
    pub url: Option<String>,
    pub max_connections: u32,
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 20,
            connect_timeout: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// Result cache tuning.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub key_prefix: String,
    /// Total-size budget enforced by the in-process fallback.
    pub max_size_bytes: u64,
    pub default_ttl: Duration,
    /// Serialized entries larger than this are gzip-compressed.
    pub compression_threshold: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "cardmaker:cache".to_string(),
            max_size_bytes: 512 * 1024 * 1024,
            default_ttl: Duration::from_secs(24 * 3600),
            compression_threshold: 512,
        }
    }
}

/// Task manager and broker tuning.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub queue_prefix: String,
    pub task_key_prefix: String,
    /// Retention for task records in the shared store.
    pub task_ttl: Duration,
    pub max_retries: u32,
    /// Soft wall-clock limit for broker-side job execution; exceeding it is
    /// logged while the job keeps running.
    pub soft_time_limit: Duration,
    /// Hard wall-clock limit for broker-side job execution; exceeding it
    /// fails the task.
    pub hard_time_limit: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            queue_prefix: "cardmaker:queue".to_string(),
            task_key_prefix: "cardmaker:task".to_string(),
            task_ttl: Duration::from_secs(24 * 3600),
            max_retries: 3,
            soft_time_limit: Duration::from_secs(240),
            hard_time_limit: Duration::from_secs(300),
        }
    }
}

/// Worker process supervision settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Argv of the worker process to supervise (program plus base arguments).
    /// Worker settings are handed over through the environment, so the
    /// command line stays deployment-specific.
    pub worker_command: Vec<String>,
    pub concurrency: usize,
    pub queues: Vec<String>,
    pub hostname: String,
    pub log_level: String,
    pub max_restarts: u32,
    pub restart_delay: Duration,
    pub health_check_interval: Duration,
    /// Workers older than this are proactively restarted to bound
    /// per-process resource leakage.
    pub max_lifetime: Duration,
    pub heartbeat_timeout: Duration,
    pub graceful_shutdown_timeout: Duration,
    /// Grace period after spawn before deciding whether the start succeeded.
    pub startup_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_command: vec!["cardmaker-worker".to_string()],
            concurrency: 2,
            queues: vec![
                "pdf_generation".to_string(),
                "pdf_offset".to_string(),
                "default".to_string(),
            ],
            hostname: "worker@localhost".to_string(),
            log_level: "info".to_string(),
            max_restarts: 5,
            restart_delay: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(3600),
            heartbeat_timeout: Duration::from_secs(60),
            graceful_shutdown_timeout: Duration::from_secs(30),
            startup_grace: Duration::from_secs(2),
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.is_empty() {
                config.backend.url = Some(url);
            }
        }
        config.backend.max_connections =
            env_parse("CARDMAKER_MAX_CONNECTIONS", config.backend.max_connections)?;
        config.backend.connect_timeout =
            env_secs("CARDMAKER_CONNECT_TIMEOUT", config.backend.connect_timeout)?;
        config.backend.socket_timeout =
            env_secs("CARDMAKER_SOCKET_TIMEOUT", config.backend.socket_timeout)?;
        config.backend.health_check_interval = env_secs(
            "CARDMAKER_HEALTH_CHECK_INTERVAL",
            config.backend.health_check_interval,
        )?;

        config.circuit_breaker.failure_threshold = env_parse(
            "CARDMAKER_CB_FAILURE_THRESHOLD",
            config.circuit_breaker.failure_threshold,
        )?;
        config.circuit_breaker.recovery_timeout = env_secs(
            "CARDMAKER_CB_RECOVERY_TIMEOUT",
            config.circuit_breaker.recovery_timeout,
        )?;

        config.cache.max_size_bytes =
            env_parse("CARDMAKER_CACHE_MAX_BYTES", config.cache.max_size_bytes)?;
        config.cache.default_ttl = env_secs("CARDMAKER_CACHE_TTL", config.cache.default_ttl)?;
        config.cache.compression_threshold = env_parse(
            "CARDMAKER_COMPRESSION_THRESHOLD",
            config.cache.compression_threshold,
        )?;

        config.tasks.max_retries = env_parse("CARDMAKER_TASK_MAX_RETRIES", config.tasks.max_retries)?;
        config.tasks.soft_time_limit =
            env_secs("CARDMAKER_SOFT_TIME_LIMIT", config.tasks.soft_time_limit)?;
        config.tasks.hard_time_limit =
            env_secs("CARDMAKER_HARD_TIME_LIMIT", config.tasks.hard_time_limit)?;

        if let Ok(command) = std::env::var("CARDMAKER_WORKER_COMMAND") {
            let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
            if argv.is_empty() {
                return Err(CoreError::configuration(
                    "CARDMAKER_WORKER_COMMAND is empty",
                ));
            }
            config.worker.worker_command = argv;
        }
        config.worker.concurrency =
            env_parse("CARDMAKER_WORKER_CONCURRENCY", config.worker.concurrency)?;
        if let Ok(queues) = std::env::var("CARDMAKER_WORKER_QUEUES") {
            config.worker.queues = queues
                .split(',')
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .collect();
        }
        if let Ok(hostname) = std::env::var("CARDMAKER_WORKER_HOSTNAME") {
            config.worker.hostname = hostname;
        }
        if let Ok(level) = std::env::var("CARDMAKER_LOG_LEVEL") {
            config.worker.log_level = level;
        }
        config.worker.max_restarts =
            env_parse("CARDMAKER_MAX_RESTARTS", config.worker.max_restarts)?;
        config.worker.restart_delay =
            env_secs("CARDMAKER_RESTART_DELAY", config.worker.restart_delay)?;
        config.worker.max_lifetime =
            env_secs("CARDMAKER_WORKER_MAX_LIFETIME", config.worker.max_lifetime)?;
        config.worker.heartbeat_timeout = env_secs(
            "CARDMAKER_HEARTBEAT_TIMEOUT",
            config.worker.heartbeat_timeout,
        )?;
        config.worker.graceful_shutdown_timeout = env_secs(
            "CARDMAKER_SHUTDOWN_TIMEOUT",
            config.worker.graceful_shutdown_timeout,
        )?;

        Ok(config)
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| CoreError::configuration(format!("Invalid {key}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(
        key,
        default.as_secs(),
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = CoreConfig::default();
        assert!(config.backend.url.is_none());
        assert_eq!(config.cache.compression_threshold, 512);
        assert_eq!(config.worker.max_restarts, 5);
        assert!(config.tasks.soft_time_limit < config.tasks.hard_time_limit);
    }

    // Single test because the process environment is shared across the test
    // harness threads.
    #[test]
    fn env_overrides_apply_and_bad_values_are_rejected() {
        std::env::set_var("CARDMAKER_MAX_RESTARTS", "9");
        std::env::set_var("CARDMAKER_WORKER_QUEUES", "pdf_generation, default");
        let config = CoreConfig::from_env().unwrap();
        assert_eq!(config.worker.max_restarts, 9);
        assert_eq!(config.worker.queues, vec!["pdf_generation", "default"]);

        std::env::set_var("CARDMAKER_MAX_RESTARTS", "not-a-number");
        let result = CoreConfig::from_env();
        assert!(matches!(result, Err(CoreError::Configuration(_))));

        std::env::remove_var("CARDMAKER_MAX_RESTARTS");
        std::env::remove_var("CARDMAKER_WORKER_QUEUES");
    }
}
