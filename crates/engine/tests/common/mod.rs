//! Shared helpers for engine integration tests

#![allow(dead_code)]

use relkv_core::{Config, ManualClock, Timestamp};
use relkv_sqlite::{SqliteConfig, SqliteDriver};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Engine settings with short cycles so tests observe background work quickly
pub fn fast_config() -> Config {
    Config {
        poll_stream_period: Duration::from_millis(20),
        purge_period: Duration::from_millis(50),
        retry_delay_period: Duration::from_millis(10),
        ..Config::default()
    }
}

/// A SQLite driver on a fresh file plus the clock it uses
pub struct TestDb {
    pub dir: TempDir,
    pub path: PathBuf,
    pub clock: Arc<ManualClock>,
}

impl TestDb {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relkv.db");
        Self {
            dir,
            path,
            clock: Arc::new(ManualClock::new(Timestamp::from_secs(1_700_000_000))),
        }
    }

    pub fn driver(&self, backend: Config) -> SqliteDriver {
        SqliteDriver::new(
            SqliteConfig::new(&self.path).with_backend(backend.with_clock(self.clock.clone())),
        )
    }

    /// Row count of `table` for `key`, read straight from the file
    pub fn rows(&self, table: &str, key: &[u8]) -> i64 {
        let conn = rusqlite::Connection::open(&self.path).unwrap();
        conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE key = ?1"),
            [key],
            |row| row.get(0),
        )
        .unwrap()
    }
}

/// Install a test subscriber once so tracing output shows up on failure
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
