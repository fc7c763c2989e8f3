//! SQLite engine adapter for relkv
//!
//! Implements the [`relkv_core::Driver`] contracts on an r2d2 pool of
//! rusqlite connections. The database runs in WAL mode so read-only
//! transactions proceed while a writer holds the lock.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod driver;
pub mod error;
pub mod migrate;
pub mod tx;

pub use config::{SqliteConfig, SqliteParams, DEFAULT_BUSY_TIMEOUT};
pub use driver::{SqliteDb, SqliteDriver, BACKEND_NAME};
pub use error::convert_error;
pub use tx::SqliteTx;
