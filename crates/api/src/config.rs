//! Application configuration loaded from environment variables.

use std::time::Duration;

use messaging::DispatcherConfig;
use outbox::PublisherConfig;
use resilience::{CircuitBreakerConfig, RetryPolicy};
use route_planner::PlannerConfig;

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` bind address (default: `"0.0.0.0"`)
/// - `PORT` listen port (default: `3000`)
/// - `RUST_LOG` tracing filter directive (default: `"info"`)
/// - `OUTBOX_POLL_INTERVAL_MS` (default: `1000`)
/// - `OUTBOX_BATCH_SIZE` (default: `100`)
/// - `OUTBOX_SENT_RETENTION_SECS` how long published rows are kept (default: `3600`)
/// - `BROKER_HISTORY_LIMIT` published messages kept for inspection (default: `10000`)
/// - `BREAKER_FAILURE_THRESHOLD` (default: `5`)
/// - `BREAKER_SUCCESS_THRESHOLD` (default: `2`)
/// - `BREAKER_TIMEOUT_MS` (default: `30000`)
/// - `STUCK_SAGA_THRESHOLD_SECS` (default: `600`)
/// - `ROUTE_MAX_LEG_KM` (default: `200`)
/// - `CONSUMER_MAX_ATTEMPTS` (default: `5`)
/// - `CONSUMER_RETRY_DELAY_MS` (default: `200`)
/// - `COURIERS` comma-separated courier names (default: `"courier-1,courier-2"`)
/// - `DATABASE_URL` when set, saga state is kept in PostgreSQL
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub outbox_sent_retention: Duration,
    pub broker_history_limit: usize,
    pub breaker_failure_threshold: u32,
    pub breaker_success_threshold: u32,
    pub breaker_timeout: Duration,
    pub stuck_saga_threshold: Duration,
    pub route_max_leg_km: f64,
    pub consumer_max_attempts: u32,
    pub consumer_retry_delay: Duration,
    pub couriers: Vec<String>,
    pub database_url: Option<String>,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            outbox_poll_interval: Duration::from_millis(env_or("OUTBOX_POLL_INTERVAL_MS", 1000)),
            outbox_batch_size: env_or("OUTBOX_BATCH_SIZE", defaults.outbox_batch_size),
            outbox_sent_retention: Duration::from_secs(env_or("OUTBOX_SENT_RETENTION_SECS", 3600)),
            broker_history_limit: env_or("BROKER_HISTORY_LIMIT", defaults.broker_history_limit),
            breaker_failure_threshold: env_or(
                "BREAKER_FAILURE_THRESHOLD",
                defaults.breaker_failure_threshold,
            ),
            breaker_success_threshold: env_or(
                "BREAKER_SUCCESS_THRESHOLD",
                defaults.breaker_success_threshold,
            ),
            breaker_timeout: Duration::from_millis(env_or("BREAKER_TIMEOUT_MS", 30_000)),
            stuck_saga_threshold: Duration::from_secs(env_or("STUCK_SAGA_THRESHOLD_SECS", 600)),
            route_max_leg_km: env_or("ROUTE_MAX_LEG_KM", defaults.route_max_leg_km),
            consumer_max_attempts: env_or("CONSUMER_MAX_ATTEMPTS", defaults.consumer_max_attempts),
            consumer_retry_delay: Duration::from_millis(env_or("CONSUMER_RETRY_DELAY_MS", 200)),
            couriers: std::env::var("COURIERS")
                .map(|v| parse_list(&v))
                .unwrap_or(defaults.couriers),
            database_url: std::env::var("DATABASE_URL").ok(),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            success_threshold: self.breaker_success_threshold,
            timeout: self.breaker_timeout,
        }
    }

    pub fn publisher(&self) -> PublisherConfig {
        PublisherConfig {
            batch_size: self.outbox_batch_size,
            poll_interval: self.outbox_poll_interval,
            retry: RetryPolicy::default(),
            sent_retention: self.outbox_sent_retention,
        }
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_attempts: self.consumer_max_attempts,
            retry_delay: self.consumer_retry_delay,
            ..DispatcherConfig::default()
        }
    }

    pub fn planner(&self) -> PlannerConfig {
        PlannerConfig {
            max_leg_km: self.route_max_leg_km,
            ..PlannerConfig::default()
        }
    }

    /// Stuck-saga threshold as a wall-clock duration.
    pub fn stuck_threshold(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stuck_saga_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(600))
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            outbox_poll_interval: Duration::from_millis(1000),
            outbox_batch_size: 100,
            outbox_sent_retention: Duration::from_secs(3600),
            broker_history_limit: messaging::DEFAULT_HISTORY_LIMIT,
            breaker_failure_threshold: 5,
            breaker_success_threshold: 2,
            breaker_timeout: Duration::from_millis(30_000),
            stuck_saga_threshold: Duration::from_secs(600),
            route_max_leg_km: 200.0,
            consumer_max_attempts: 5,
            consumer_retry_delay: Duration::from_millis(200),
            couriers: vec!["courier-1".to_string(), "courier-2".to_string()],
            database_url: None,
        }
    }
}
