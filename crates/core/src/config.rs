//! Backend configuration
//!
//! [`ConfigParams`] is the loosely-typed form read from a file: every field is
//! optional and durations are in milliseconds. It is turned into a validated
//! [`Config`] exactly once, by [`ConfigParams::check_and_set_defaults`], which
//! fills every absent or zero field with its documented default.
//!
//! ```toml
//! buffer_size = 1024
//! poll_stream_period_ms = 1000
//! purge_period_ms = 10000
//! retry_delay_period_ms = 250
//! max_idle_conns = 2
//! max_open_conns = 50
//! # conn_max_idle_time_ms = 60000   # unbounded when absent
//! # conn_max_lifetime_ms = 3600000  # unbounded when absent
//! ```

use crate::clock::{Clock, SystemClock};
use crate::error::{BackendError, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Default capacity of the notification buffer
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Default period between poll cycles
pub const DEFAULT_POLL_STREAM_PERIOD: Duration = Duration::from_secs(1);

/// Default period between purge cycles
pub const DEFAULT_PURGE_PERIOD: Duration = Duration::from_secs(10);

/// Default delay before a transaction is retried after a serialization failure
pub const DEFAULT_RETRY_DELAY_PERIOD: Duration = Duration::from_millis(250);

/// Default number of idle connections retained in the pool
pub const DEFAULT_MAX_IDLE_CONNS: u32 = 2;

/// Default maximum number of open connections
pub const DEFAULT_MAX_OPEN_CONNS: u32 = 50;

/// Idle time after which connections beyond `max_idle_conns` are closed
/// when no `conn_max_idle_time` is configured
pub const DEFAULT_IDLE_REAP_TIME: Duration = Duration::from_secs(60);

/// Connection pool tunables
///
/// Pools keep `max_idle_conns` connections open and close the surplus once
/// it has been idle for [`PoolConfig::idle_timeout`]. Idle connections above
/// the limit are therefore released after a delay, not immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Close connections idle for longer than this. `None` closes only the
    /// surplus above `max_idle_conns`, after [`DEFAULT_IDLE_REAP_TIME`].
    pub conn_max_idle_time: Option<Duration>,
    /// Close connections older than this. `None` keeps them.
    pub conn_max_lifetime: Option<Duration>,
    /// Idle connections retained in the pool
    pub max_idle_conns: u32,
    /// Upper bound on open connections
    pub max_open_conns: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            conn_max_idle_time: None,
            conn_max_lifetime: None,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            max_open_conns: DEFAULT_MAX_OPEN_CONNS,
        }
    }
}

impl PoolConfig {
    /// Idle time after which a connection above `max_idle_conns` is closed.
    ///
    /// `None` only when every open connection may stay idle, that is when
    /// `max_idle_conns` reaches `max_open_conns` and no idle time is set.
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.conn_max_idle_time {
            Some(idle) => Some(idle),
            None if self.max_idle_conns < self.max_open_conns => Some(DEFAULT_IDLE_REAP_TIME),
            None => None,
        }
    }
}

/// Validated, engine-independent backend configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of the notification buffer. A poll cycle fetches at most half.
    pub buffer_size: usize,
    /// Period between poll cycles. Also bounds each cycle's transaction.
    pub poll_stream_period: Duration,
    /// Period between purge cycles
    pub purge_period: Duration,
    /// Delay before retrying a transaction that failed as Retryable
    pub retry_delay_period: Duration,
    /// Connection pool tunables
    pub pool: PoolConfig,
    /// Time source for lease expiry
    pub clock: Arc<dyn Clock>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            poll_stream_period: DEFAULT_POLL_STREAM_PERIOD,
            purge_period: DEFAULT_PURGE_PERIOD,
            retry_delay_period: DEFAULT_RETRY_DELAY_PERIOD,
            pool: PoolConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl Config {
    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of events fetched per poll cycle
    pub fn poll_batch_size(&self) -> usize {
        (self.buffer_size / 2).max(1)
    }
}

/// File form of [`Config`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConfigParams {
    /// Notification buffer capacity
    #[serde(default)]
    pub buffer_size: Option<usize>,
    /// Poll period in milliseconds
    #[serde(default)]
    pub poll_stream_period_ms: Option<u64>,
    /// Purge period in milliseconds
    #[serde(default)]
    pub purge_period_ms: Option<u64>,
    /// Retry delay in milliseconds
    #[serde(default)]
    pub retry_delay_period_ms: Option<u64>,
    /// Maximum connection idle time in milliseconds
    #[serde(default)]
    pub conn_max_idle_time_ms: Option<u64>,
    /// Maximum connection lifetime in milliseconds
    #[serde(default)]
    pub conn_max_lifetime_ms: Option<u64>,
    /// Idle connections retained in the pool
    #[serde(default)]
    pub max_idle_conns: Option<u32>,
    /// Upper bound on open connections
    #[serde(default)]
    pub max_open_conns: Option<u32>,
}

fn period(ms: Option<u64>, default: Duration) -> Duration {
    match ms {
        Some(ms) if ms > 0 => Duration::from_millis(ms),
        _ => default,
    }
}

fn bound(ms: Option<u64>) -> Option<Duration> {
    ms.filter(|ms| *ms > 0).map(Duration::from_millis)
}

impl ConfigParams {
    /// Validate and fill defaults, producing the typed configuration.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if `max_open_conns` is explicitly zero.
    pub fn check_and_set_defaults(self, clock: Arc<dyn Clock>) -> Result<Config> {
        let max_open_conns = match self.max_open_conns {
            Some(0) => {
                return Err(BackendError::bad_parameter(
                    "max_open_conns must be greater than zero",
                ))
            }
            Some(n) => n,
            None => DEFAULT_MAX_OPEN_CONNS,
        };
        let max_idle_conns = self
            .max_idle_conns
            .unwrap_or(DEFAULT_MAX_IDLE_CONNS)
            .min(max_open_conns);

        Ok(Config {
            buffer_size: self
                .buffer_size
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_BUFFER_SIZE),
            poll_stream_period: period(self.poll_stream_period_ms, DEFAULT_POLL_STREAM_PERIOD),
            purge_period: period(self.purge_period_ms, DEFAULT_PURGE_PERIOD),
            retry_delay_period: period(self.retry_delay_period_ms, DEFAULT_RETRY_DELAY_PERIOD),
            pool: PoolConfig {
                conn_max_idle_time: bound(self.conn_max_idle_time_ms),
                conn_max_lifetime: bound(self.conn_max_lifetime_ms),
                max_idle_conns,
                max_open_conns,
            },
            clock,
        })
    }
}

/// Parse a TOML document into a params struct, as adapters do for their
/// own configuration files.
pub fn parse_toml<T: serde::de::DeserializeOwned>(content: &str) -> Result<T> {
    toml::from_str(content)
        .map_err(|e| BackendError::bad_parameter(format!("invalid configuration: {}", e)))
}

/// Read and parse a TOML configuration file.
pub fn read_toml<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        BackendError::bad_parameter(format!(
            "failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;
    parse_toml(&content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::Timestamp;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(ManualClock::new(Timestamp::from_secs(1)))
    }

    #[test]
    fn test_defaults() {
        let cfg = ConfigParams::default().check_and_set_defaults(clock()).unwrap();
        assert_eq!(cfg.buffer_size, 1024);
        assert_eq!(cfg.poll_stream_period, Duration::from_secs(1));
        assert_eq!(cfg.purge_period, Duration::from_secs(10));
        assert_eq!(cfg.retry_delay_period, Duration::from_millis(250));
        assert_eq!(cfg.pool, PoolConfig::default());
        assert_eq!(cfg.poll_batch_size(), 512);
    }

    #[test]
    fn test_zero_values_take_defaults() {
        let params = ConfigParams {
            buffer_size: Some(0),
            poll_stream_period_ms: Some(0),
            conn_max_lifetime_ms: Some(0),
            ..Default::default()
        };
        let cfg = params.check_and_set_defaults(clock()).unwrap();
        assert_eq!(cfg.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(cfg.poll_stream_period, DEFAULT_POLL_STREAM_PERIOD);
        assert_eq!(cfg.pool.conn_max_lifetime, None);
    }

    #[test]
    fn test_zero_open_conns_rejected() {
        let params = ConfigParams {
            max_open_conns: Some(0),
            ..Default::default()
        };
        let err = params.check_and_set_defaults(clock()).unwrap_err();
        assert!(matches!(err, BackendError::BadParameter(_)));
    }

    #[test]
    fn test_idle_clamped_to_open() {
        let params = ConfigParams {
            max_idle_conns: Some(10),
            max_open_conns: Some(4),
            ..Default::default()
        };
        let cfg = params.check_and_set_defaults(clock()).unwrap();
        assert_eq!(cfg.pool.max_idle_conns, 4);
    }

    #[test]
    fn test_surplus_idle_connections_are_reaped() {
        let pool = PoolConfig::default();
        assert_eq!(pool.idle_timeout(), Some(DEFAULT_IDLE_REAP_TIME));

        let pool = PoolConfig {
            conn_max_idle_time: Some(Duration::from_secs(5)),
            ..PoolConfig::default()
        };
        assert_eq!(pool.idle_timeout(), Some(Duration::from_secs(5)));

        let pool = PoolConfig {
            max_idle_conns: 4,
            max_open_conns: 4,
            ..PoolConfig::default()
        };
        assert_eq!(pool.idle_timeout(), None);
    }

    #[test]
    fn test_parse_toml() {
        let params: ConfigParams = parse_toml(
            r#"
            buffer_size = 64
            poll_stream_period_ms = 50
            conn_max_idle_time_ms = 1000
            "#,
        )
        .unwrap();
        let cfg = params.check_and_set_defaults(clock()).unwrap();
        assert_eq!(cfg.buffer_size, 64);
        assert_eq!(cfg.poll_batch_size(), 32);
        assert_eq!(cfg.poll_stream_period, Duration::from_millis(50));
        assert_eq!(cfg.pool.conn_max_idle_time, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_parse_toml_rejects_wrong_types() {
        let err = parse_toml::<ConfigParams>("buffer_size = \"large\"").unwrap_err();
        assert!(matches!(err, BackendError::BadParameter(_)));
    }
}
