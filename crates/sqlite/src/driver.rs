//! SQLite driver and connection pool

use crate::config::{SqliteConfig, DEFAULT_BUSY_TIMEOUT};
use crate::migrate::migrate;
use crate::tx::SqliteTx;
use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use relkv_core::{BackendError, Clock, Config, Connection, Context, Driver, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Engine name reported by [`SqliteDriver`]
pub const BACKEND_NAME: &str = "sqlite";

/// Wait for a pooled connection when the context carries no deadline
const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Driver for a single SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteDriver {
    cfg: SqliteConfig,
}

impl SqliteDriver {
    /// Create a driver from a validated configuration
    pub fn new(cfg: SqliteConfig) -> Self {
        Self { cfg }
    }

    /// Adapter-specific configuration
    pub fn sqlite_config(&self) -> &SqliteConfig {
        &self.cfg
    }
}

fn checkout_timeout(ctx: &Context) -> Duration {
    ctx.remaining()
        .unwrap_or(DEFAULT_CHECKOUT_TIMEOUT)
        .max(Duration::from_millis(1))
}

fn configure(conn: &mut rusqlite::Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

impl Driver for SqliteDriver {
    type Conn = SqliteDb;

    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn config(&self) -> &Config {
        &self.cfg.backend
    }

    fn open(&self, ctx: &Context) -> Result<SqliteDb> {
        ctx.check()?;
        if let Some(parent) = self.cfg.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BackendError::connection(format!(
                        "failed to create '{}': {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let pool_cfg = &self.cfg.backend.pool;
        let manager = SqliteConnectionManager::file(&self.cfg.path).with_init(configure);
        let pool = Pool::builder()
            .max_size(pool_cfg.max_open_conns)
            .min_idle(Some(pool_cfg.max_idle_conns))
            .idle_timeout(pool_cfg.idle_timeout())
            .max_lifetime(pool_cfg.conn_max_lifetime)
            .connection_timeout(checkout_timeout(ctx))
            .build(manager)
            .map_err(|e| {
                BackendError::connection(format!(
                    "failed to open '{}': {}",
                    self.cfg.path.display(),
                    e
                ))
            })?;

        let mut conn = pool
            .get_timeout(checkout_timeout(ctx))
            .map_err(|e| BackendError::connection(e.to_string()))?;
        let version = migrate(&mut conn, self.cfg.backend.clock.now())?;
        info!(
            path = %self.cfg.path.display(),
            schema_version = version,
            "opened sqlite database"
        );

        drop(conn);
        Ok(SqliteDb {
            pool: Mutex::new(Some(pool)),
            clock: Arc::clone(&self.cfg.backend.clock),
            busy_timeout: self.cfg.busy_timeout,
        })
    }
}

/// Pooled connection to a SQLite database
///
/// [`Connection::close`] drops the pool. Idle connections close at once;
/// connections held by open transactions close when those transactions end.
pub struct SqliteDb {
    pool: Mutex<Option<Pool<SqliteConnectionManager>>>,
    clock: Arc<dyn Clock>,
    busy_timeout: Duration,
}

impl std::fmt::Debug for SqliteDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pool = self.pool.lock();
        f.debug_struct("SqliteDb")
            .field("state", &pool.as_ref().map(|p| p.state()))
            .field("closed", &pool.is_none())
            .finish_non_exhaustive()
    }
}

impl SqliteDb {
    fn begin_tx(&self, ctx: &Context, read_only: bool) -> SqliteTx {
        let clock = Arc::clone(&self.clock);
        let Some(pool) = self.pool.lock().clone() else {
            return SqliteTx::failed(
                BackendError::connection("database is closed"),
                ctx,
                clock,
                read_only,
            );
        };
        if let Err(err) = ctx.check() {
            return SqliteTx::failed(err, ctx, clock, read_only);
        }
        match pool.get_timeout(checkout_timeout(ctx)) {
            Ok(conn) => SqliteTx::start(conn, ctx, clock, read_only, self.busy_timeout),
            Err(e) => SqliteTx::failed(
                BackendError::connection(e.to_string()),
                ctx,
                clock,
                read_only,
            ),
        }
    }
}

impl Connection for SqliteDb {
    type Tx = SqliteTx;

    fn begin(&self, ctx: &Context) -> SqliteTx {
        self.begin_tx(ctx, false)
    }

    fn read_only(&self, ctx: &Context) -> SqliteTx {
        self.begin_tx(ctx, true)
    }

    fn close(&self) -> Result<()> {
        if let Some(pool) = self.pool.lock().take() {
            drop(pool);
            info!("closed sqlite database");
        }
        Ok(())
    }
}
