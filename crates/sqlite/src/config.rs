//! SQLite adapter configuration
//!
//! ```toml
//! path = "/var/lib/relkv/relkv.db"
//! busy_timeout_ms = 5000
//! poll_stream_period_ms = 1000
//! ```

use relkv_core::config::{parse_toml, read_toml};
use relkv_core::{BackendError, Clock, Config, ConfigParams, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default time a writer waits for the database lock before the transaction
/// fails as Retryable
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Validated SQLite adapter configuration
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database file, created if missing
    pub path: PathBuf,
    /// Lock wait for read-write transactions. Zero fails immediately.
    pub busy_timeout: Duration,
    /// Engine-independent settings
    pub backend: Config,
}

impl SqliteConfig {
    /// Configuration with defaults for everything but the path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            backend: Config::default(),
        }
    }

    /// Replace the clock used for lease expiry
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.backend.clock = clock;
        self
    }

    /// Replace the lock wait
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    /// Replace the engine-independent settings
    pub fn with_backend(mut self, backend: Config) -> Self {
        self.backend = backend;
        self
    }
}

/// File form of [`SqliteConfig`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SqliteParams {
    /// Database file
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Lock wait in milliseconds; zero fails immediately
    #[serde(default)]
    pub busy_timeout_ms: Option<u64>,
    /// Engine-independent settings
    #[serde(flatten)]
    pub backend: ConfigParams,
}

impl SqliteParams {
    /// Parse from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        parse_toml(content)
    }

    /// Parse from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        read_toml(path)
    }

    /// Validate and fill defaults.
    ///
    /// # Errors
    ///
    /// Returns `BadParameter` if `path` is missing or empty.
    pub fn check_and_set_defaults(self, clock: Arc<dyn Clock>) -> Result<SqliteConfig> {
        let path = self
            .path
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| BackendError::bad_parameter("path is required"))?;
        Ok(SqliteConfig {
            path,
            busy_timeout: self
                .busy_timeout_ms
                .map_or(DEFAULT_BUSY_TIMEOUT, Duration::from_millis),
            backend: self.backend.check_and_set_defaults(clock)?,
        })
    }
}
