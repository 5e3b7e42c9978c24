//! Platform configuration loaded from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use event_bus::{DEFAULT_LEDGER_CAPACITY, RetryPolicy};
use saga::SagaPolicy;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, ()> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(()),
        }
    }
}

/// Platform configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `RUST_LOG` tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT` `pretty` or `json` (default: `pretty`)
/// - `METRICS_ADDR` Prometheus listener (default: `0.0.0.0:9000`)
/// - `DATABASE_URL` PostgreSQL when set, in-memory stores otherwise
/// - `DATABASE_MAX_CONNECTIONS` pool size (default: `10`)
/// - `SNAPSHOTS_ENABLED` (default: `true`)
/// - `CONFLICT_RETRY_LIMIT` attempts on a concurrency conflict (default: `3`)
/// - `EVENT_HANDLER_MAX_ATTEMPTS` delivery attempts per handler (default: `3`)
/// - `EVENT_HANDLER_BACKOFF_MS` pause between delivery attempts (default: `100`)
/// - `LEDGER_CAPACITY` processed-event ledger entries (default: `100000`)
/// - `SAGA_MAX_STEP_ATTEMPTS` (default: `3`)
/// - `SAGA_MAX_COMPENSATION_ATTEMPTS` (default: `3`)
/// - `SAGA_RETRY_BACKOFF_MS` (default: `100`)
///
/// Values that do not parse fall back to the default.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_filter: String,
    pub log_format: LogFormat,
    pub metrics_addr: SocketAddr,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub snapshots_enabled: bool,
    pub conflict_retry_limit: u32,
    pub event_handler_max_attempts: u32,
    pub event_handler_backoff: Duration,
    pub ledger_capacity: usize,
    pub saga_max_step_attempts: u32,
    pub saga_max_compensation_attempts: u32,
    pub saga_retry_backoff: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str| parse(&lookup, key).map(Duration::from_millis);

        Self {
            log_filter: lookup("RUST_LOG").unwrap_or(defaults.log_filter),
            log_format: parse(&lookup, "LOG_FORMAT").unwrap_or(defaults.log_format),
            metrics_addr: parse(&lookup, "METRICS_ADDR").unwrap_or(defaults.metrics_addr),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            database_max_connections: parse(&lookup, "DATABASE_MAX_CONNECTIONS")
                .unwrap_or(defaults.database_max_connections),
            snapshots_enabled: parse(&lookup, "SNAPSHOTS_ENABLED")
                .unwrap_or(defaults.snapshots_enabled),
            conflict_retry_limit: parse(&lookup, "CONFLICT_RETRY_LIMIT")
                .unwrap_or(defaults.conflict_retry_limit),
            event_handler_max_attempts: parse(&lookup, "EVENT_HANDLER_MAX_ATTEMPTS")
                .unwrap_or(defaults.event_handler_max_attempts),
            event_handler_backoff: millis("EVENT_HANDLER_BACKOFF_MS")
                .unwrap_or(defaults.event_handler_backoff),
            ledger_capacity: parse(&lookup, "LEDGER_CAPACITY").unwrap_or(defaults.ledger_capacity),
            saga_max_step_attempts: parse(&lookup, "SAGA_MAX_STEP_ATTEMPTS")
                .unwrap_or(defaults.saga_max_step_attempts),
            saga_max_compensation_attempts: parse(&lookup, "SAGA_MAX_COMPENSATION_ATTEMPTS")
                .unwrap_or(defaults.saga_max_compensation_attempts),
            saga_retry_backoff: millis("SAGA_RETRY_BACKOFF_MS")
                .unwrap_or(defaults.saga_retry_backoff),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::attempts(self.event_handler_max_attempts, self.event_handler_backoff)
    }

    pub fn saga_policy(&self) -> SagaPolicy {
        SagaPolicy {
            max_step_attempts: self.saga_max_step_attempts,
            max_compensation_attempts: self.saga_max_compensation_attempts,
            backoff: self.saga_retry_backoff,
        }
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.trim().parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            database_url: None,
            database_max_connections: 10,
            snapshots_enabled: true,
            conflict_retry_limit: 3,
            event_handler_max_attempts: 3,
            event_handler_backoff: Duration::from_millis(100),
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            saga_max_step_attempts: 3,
            saga_max_compensation_attempts: 3,
            saga_retry_backoff: Duration::from_millis(100),
        }
    }
}
