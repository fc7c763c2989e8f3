//! SQLite transaction
//!
//! A read-write transaction starts with `BEGIN IMMEDIATE` so that write
//! contention surfaces at begin time as a Retryable error. A read-only
//! transaction sets `query_only` on its pooled connection and starts with
//! `BEGIN DEFERRED`; the next read-write transaction on that connection
//! clears it again.

use crate::error::convert_error;
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use relkv_core::{
    new_id, Access, BackendError, Clock, Context, Event, EventBatch, Item, Lease, NativeTx, OpType,
    Result, Timestamp, Transaction, TxState,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A pooled connection with at most one open engine transaction
pub(crate) struct SqliteSession {
    conn: Option<PooledConnection<SqliteConnectionManager>>,
    open: bool,
    read_only: bool,
}

impl SqliteSession {
    fn begin(
        conn: PooledConnection<SqliteConnectionManager>,
        read_only: bool,
        busy_timeout: Duration,
    ) -> std::result::Result<Self, (Self, BackendError)> {
        let mut session = SqliteSession {
            conn: Some(conn),
            open: false,
            read_only,
        };
        match session.start(busy_timeout) {
            Ok(()) => Ok(session),
            Err(err) => Err((session, err)),
        }
    }

    fn detached(read_only: bool) -> Self {
        SqliteSession {
            conn: None,
            open: false,
            read_only,
        }
    }

    fn start(&mut self, busy_timeout: Duration) -> Result<()> {
        let sql = if self.read_only {
            "PRAGMA query_only = ON; BEGIN DEFERRED"
        } else {
            "PRAGMA query_only = OFF; BEGIN IMMEDIATE"
        };
        let conn = self.conn()?;
        conn.busy_timeout(busy_timeout).map_err(convert_error)?;
        conn.execute_batch(sql).map_err(convert_error)?;
        self.open = true;
        Ok(())
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_deref()
            .ok_or_else(|| BackendError::connection("no connection"))
    }

    fn end(&mut self, sql: &str) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        let conn = self
            .conn
            .as_deref()
            .ok_or_else(|| BackendError::connection("no connection"))?;
        conn.execute_batch(sql).map_err(convert_error)?;
        self.open = false;
        Ok(())
    }
}

impl NativeTx for SqliteSession {
    fn commit(&mut self) -> Result<()> {
        self.end("COMMIT")
    }

    fn rollback(&mut self) -> Result<()> {
        self.end("ROLLBACK")
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.end("ROLLBACK") {
                debug!(error = %err, "rollback on drop failed");
            }
        }
    }
}

/// Transaction against a SQLite database
pub struct SqliteTx {
    session: SqliteSession,
    state: TxState,
    ctx: Context,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SqliteTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTx")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl SqliteTx {
    pub(crate) fn start(
        conn: PooledConnection<SqliteConnectionManager>,
        ctx: &Context,
        clock: Arc<dyn Clock>,
        read_only: bool,
        busy_timeout: Duration,
    ) -> Self {
        let busy_timeout = ctx
            .remaining()
            .map_or(busy_timeout, |left| left.min(busy_timeout));
        match SqliteSession::begin(conn, read_only, busy_timeout) {
            Ok(session) => SqliteTx {
                session,
                state: TxState::active(read_only),
                ctx: ctx.clone(),
                clock,
            },
            Err((session, err)) => SqliteTx {
                session,
                state: TxState::failed(err, read_only),
                ctx: ctx.clone(),
                clock,
            },
        }
    }

    pub(crate) fn failed(
        err: BackendError,
        ctx: &Context,
        clock: Arc<dyn Clock>,
        read_only: bool,
    ) -> Self {
        SqliteTx {
            session: SqliteSession::detached(read_only),
            state: TxState::failed(err, read_only),
            ctx: ctx.clone(),
            clock,
        }
    }

    fn exec<T, F>(&mut self, op: &'static str, access: Access, f: F) -> Result<T>
    where
        F: FnOnce(&Connection, i64) -> Result<T>,
    {
        let now = self.clock.now().as_sql_micros();
        self.state
            .run(&mut self.session, &self.ctx, op, access, |session| {
                f(session.conn()?, now)
            })
    }

    /// Insert `item` under an explicit ID
    pub(crate) fn insert_item_with_id(&mut self, item: &Item, id: i64) -> Result<i64> {
        self.exec("insert_item", Access::Write, |conn, _| {
            conn.execute(
                "INSERT INTO item (key, id, value) VALUES (?1, ?2, ?3)",
                params![item.key, id, item.value],
            )
            .map_err(convert_error)?;
            Ok(id)
        })
    }
}

fn expires_param(expires: Option<Timestamp>) -> Option<i64> {
    expires.map(|t| t.as_sql_micros())
}

fn expires_column(value: Option<i64>) -> Option<Timestamp> {
    value.map(Timestamp::from_sql_micros)
}

fn lease_from_row(row: &Row<'_>) -> rusqlite::Result<Lease> {
    Ok(Lease {
        key: row.get(0)?,
        id: row.get(1)?,
        expires: expires_column(row.get(2)?),
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<Item> {
    Ok(Item {
        key: row.get(0)?,
        value: row.get(1)?,
        id: row.get(2)?,
        expires: expires_column(row.get(3)?),
    })
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

const SELECT_CURRENT_ITEM: &str = "SELECT lease.key, item.value, lease.id, lease.expires \
     FROM lease JOIN item ON item.key = lease.key AND item.id = lease.id";

impl Transaction for SqliteTx {
    fn err(&self) -> Option<&BackendError> {
        self.state.err()
    }

    fn commit(&mut self) -> Result<()> {
        self.state.commit(&mut self.session, &self.ctx)
    }

    fn rollback(&mut self, err: BackendError) -> BackendError {
        self.state.rollback(&mut self.session, err)
    }

    fn delete_events(&mut self, before_event_id: i64) -> Result<u64> {
        self.exec("delete_events", Access::Write, |conn, _| {
            let n = conn
                .execute("DELETE FROM event WHERE eventid <= ?1", [before_event_id])
                .map_err(convert_error)?;
            Ok(n as u64)
        })
    }

    fn delete_expired_leases(&mut self) -> Result<u64> {
        self.exec("delete_expired_leases", Access::Write, |conn, now| {
            let n = conn
                .execute(
                    "DELETE FROM lease WHERE expires IS NOT NULL AND expires <= ?1",
                    [now],
                )
                .map_err(convert_error)?;
            Ok(n as u64)
        })
    }

    fn delete_items(&mut self, before_event_id: i64) -> Result<u64> {
        self.exec("delete_items", Access::Write, |conn, _| {
            let n = conn
                .execute(
                    "DELETE FROM item WHERE NOT EXISTS (
                        SELECT 1 FROM lease WHERE lease.key = item.key AND lease.id = item.id
                     ) AND NOT EXISTS (
                        SELECT 1 FROM event WHERE event.key = item.key AND event.id = item.id
                        AND event.eventid > ?1
                     )",
                    [before_event_id],
                )
                .map_err(convert_error)?;
            Ok(n as u64)
        })
    }

    fn delete_lease(&mut self, key: &[u8]) -> Result<Option<i64>> {
        self.exec("delete_lease", Access::Write, |conn, _| {
            conn.query_row("DELETE FROM lease WHERE key = ?1 RETURNING id", [key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(convert_error)
        })
    }

    fn delete_lease_range(&mut self, start_key: &[u8], end_key: &[u8]) -> Result<Vec<Lease>> {
        self.exec("delete_lease_range", Access::Write, |conn, _| {
            let mut stmt = conn
                .prepare("DELETE FROM lease WHERE key BETWEEN ?1 AND ?2 RETURNING key, id, expires")
                .map_err(convert_error)?;
            let mut leases = stmt
                .query_map(params![start_key, end_key], lease_from_row)
                .map_err(convert_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(convert_error)?;
            leases.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(leases)
        })
    }

    fn get_events(&mut self, from_event_id: i64, limit: usize) -> Result<EventBatch> {
        self.exec("get_events", Access::Read, |conn, _| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT event.eventid, event.type, event.key, event.id, event.expires, item.value
                     FROM event LEFT JOIN item ON item.key = event.key AND item.id = event.id
                     WHERE event.eventid > ?1 ORDER BY event.eventid LIMIT ?2",
                )
                .map_err(convert_error)?;
            let rows = stmt
                .query_map(params![from_event_id, sql_limit(limit)], |row| {
                    let kind: i16 = row.get(1)?;
                    let value: Option<Vec<u8>> = row.get(5)?;
                    Ok((
                        kind,
                        row.get::<_, i64>(0)?,
                        Item {
                            key: row.get(2)?,
                            id: row.get(3)?,
                            expires: expires_column(row.get(4)?),
                            value: value.unwrap_or_default(),
                        },
                    ))
                })
                .map_err(convert_error)?;

            let mut events = Vec::new();
            for row in rows {
                let (kind, event_id, item) = row.map_err(convert_error)?;
                let op = OpType::from_i16(kind).ok_or_else(|| {
                    BackendError::engine(format!("event {event_id} has unknown type {kind}"))
                })?;
                events.push(Event { event_id, op, item });
            }
            Ok(EventBatch::from_events(from_event_id, events))
        })
    }

    fn get_expired_leases(&mut self) -> Result<Vec<Lease>> {
        self.exec("get_expired_leases", Access::Read, |conn, now| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT key, id, expires FROM lease
                     WHERE expires IS NOT NULL AND expires <= ?1 ORDER BY key",
                )
                .map_err(convert_error)?;
            let leases = stmt
                .query_map([now], lease_from_row)
                .map_err(convert_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(convert_error)?;
            Ok(leases)
        })
    }

    fn get_item(&mut self, key: &[u8]) -> Result<Option<Item>> {
        self.exec("get_item", Access::Read, |conn, now| {
            conn.query_row(
                &format!(
                    "{SELECT_CURRENT_ITEM} WHERE lease.key = ?1 \
                     AND (lease.expires IS NULL OR lease.expires > ?2)"
                ),
                params![key, now],
                item_from_row,
            )
            .optional()
            .map_err(convert_error)
        })
    }

    fn get_item_range(
        &mut self,
        start_key: &[u8],
        end_key: &[u8],
        limit: usize,
    ) -> Result<Vec<Item>> {
        self.exec("get_item_range", Access::Read, |conn, now| {
            let mut stmt = conn
                .prepare_cached(&format!(
                    "{SELECT_CURRENT_ITEM} WHERE lease.key BETWEEN ?1 AND ?2 \
                     AND (lease.expires IS NULL OR lease.expires > ?3) \
                     ORDER BY lease.key LIMIT ?4"
                ))
                .map_err(convert_error)?;
            let items = stmt
                .query_map(
                    params![start_key, end_key, now, sql_limit(limit)],
                    item_from_row,
                )
                .map_err(convert_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(convert_error)?;
            Ok(items)
        })
    }

    fn get_item_value(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.exec("get_item_value", Access::Read, |conn, now| {
            conn.query_row(
                "SELECT item.value FROM lease
                 JOIN item ON item.key = lease.key AND item.id = lease.id
                 WHERE lease.key = ?1 AND (lease.expires IS NULL OR lease.expires > ?2)",
                params![key, now],
                |row| row.get(0),
            )
            .optional()
            .map_err(convert_error)
        })
    }

    fn get_last_event_id(&mut self) -> Result<i64> {
        self.exec("get_last_event_id", Access::Read, |conn, _| {
            conn.query_row("SELECT COALESCE(MAX(eventid), 0) FROM event", [], |row| {
                row.get(0)
            })
            .map_err(convert_error)
        })
    }

    fn insert_event(&mut self, op: OpType, item: &Item) -> Result<()> {
        self.exec("insert_event", Access::Write, |conn, now| {
            conn.execute(
                "INSERT INTO event (created, key, id, type, expires) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![now, item.key, item.id, op.as_i16(), expires_param(item.expires)],
            )
            .map_err(convert_error)?;
            Ok(())
        })
    }

    fn insert_item(&mut self, item: &Item) -> Result<i64> {
        self.insert_item_with_id(item, new_id())
    }

    fn lease_exists(&mut self, key: &[u8]) -> Result<bool> {
        self.exec("lease_exists", Access::Read, |conn, now| {
            conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM lease
                 WHERE key = ?1 AND (expires IS NULL OR expires > ?2))",
                params![key, now],
                |row| row.get(0),
            )
            .map_err(convert_error)
        })
    }

    fn update_lease(&mut self, item: &Item) -> Result<()> {
        self.exec("update_lease", Access::Write, |conn, _| {
            let n = conn
                .execute(
                    "UPDATE lease SET id = ?2, expires = ?3 WHERE key = ?1",
                    params![item.key, item.id, expires_param(item.expires)],
                )
                .map_err(convert_error)?;
            if n == 0 {
                return Err(BackendError::not_found(format!(
                    "no lease for key {:?}",
                    String::from_utf8_lossy(&item.key)
                )));
            }
            Ok(())
        })
    }

    fn upsert_lease(&mut self, item: &Item) -> Result<()> {
        self.exec("upsert_lease", Access::Write, |conn, _| {
            conn.execute(
                "INSERT INTO lease (key, id, expires) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET id = excluded.id, expires = excluded.expires",
                params![item.key, item.id, expires_param(item.expires)],
            )
            .map_err(convert_error)?;
            Ok(())
        })
    }
}
