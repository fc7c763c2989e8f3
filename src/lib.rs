//! relkv - Versioned key/value storage on a relational engine
//!
//! relkv keeps every written value as an immutable item row, binds the
//! current one to its key through a lease with an optional expiry, and
//! records each mutation in an ordered event log. A background worker
//! expires leases, streams events to a consumer and purges rows nobody can
//! observe any more.
//!
//! # Quick Start
//!
//! ```ignore
//! use relkv::{Backend, Context, EventBuffer, Item, SqliteConfig, SqliteDriver};
//! use std::sync::Arc;
//!
//! let ctx = Context::background();
//! let buffer = EventBuffer::new(1024);
//! let backend = Backend::new(
//!     SqliteDriver::new(SqliteConfig::new("relkv.db")),
//!     Arc::new(buffer.clone()),
//!     &ctx,
//! )?;
//!
//! let mut watcher = buffer.watch();
//! backend.put(&ctx, Item::new("user:123", "alice"))?;
//! let item = backend.get(&ctx, b"user:123")?;
//! ```
//!
//! # Engines
//!
//! - SQLite, always available
//! - PostgreSQL with mutual TLS, behind the default `postgres` feature

pub use relkv_core::*;
pub use relkv_engine::{
    retry_tx, Backend, EventBuffer, EventSink, PurgeStats, Scheduler, WatchError, Watcher,
    Watermark,
};
pub use relkv_sqlite::{SqliteConfig, SqliteDb, SqliteDriver, SqliteParams, SqliteTx};

#[cfg(feature = "postgres")]
pub use relkv_postgres::{PgTx, PostgresConfig, PostgresDb, PostgresDriver, PostgresParams, TlsConfig};
