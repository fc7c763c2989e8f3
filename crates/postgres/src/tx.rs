//! PostgreSQL transaction
//!
//! Every transaction runs at SERIALIZABLE isolation. Read-only transactions
//! add `READ ONLY`, so the server rejects writes as well. When the context
//! carries a deadline it becomes the transaction's `statement_timeout`.

use crate::error::convert_error;
use postgres::{Client, Row};
use postgres_native_tls::MakeTlsConnector;
use r2d2::PooledConnection;
use r2d2_postgres::PostgresConnectionManager;
use relkv_core::{
    new_id, Access, BackendError, Clock, Context, Event, EventBatch, Item, Lease, NativeTx, OpType,
    Result, Timestamp, Transaction, TxState,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

pub(crate) type PooledClient = PooledConnection<PostgresConnectionManager<MakeTlsConnector>>;

/// Advisory lock key held by every transaction that appends an event.
/// Sequence values are handed out at insert time, so serializing the
/// inserters until commit keeps EventID order equal to commit order.
const EVENT_LOCK: i64 = 0x72_6c_6b_76_65_76;

/// A pooled client with at most one open server transaction
pub(crate) struct PgSession {
    client: Option<PooledClient>,
    open: bool,
}

impl PgSession {
    fn begin(
        client: PooledClient,
        read_only: bool,
        timeout: Option<Duration>,
    ) -> std::result::Result<Self, (Self, BackendError)> {
        let mut session = PgSession {
            client: Some(client),
            open: false,
        };
        match session.start(read_only, timeout) {
            Ok(()) => Ok(session),
            Err(err) => Err((session, err)),
        }
    }

    fn detached() -> Self {
        PgSession {
            client: None,
            open: false,
        }
    }

    fn start(&mut self, read_only: bool, timeout: Option<Duration>) -> Result<()> {
        let mut sql = String::from(if read_only {
            "BEGIN ISOLATION LEVEL SERIALIZABLE READ ONLY"
        } else {
            "BEGIN ISOLATION LEVEL SERIALIZABLE"
        });
        if let Some(timeout) = timeout {
            let ms = timeout.as_millis().clamp(1, i32::MAX as u128);
            sql.push_str(&format!("; SET LOCAL statement_timeout = {ms}"));
        }
        // Marked open first: a failure after BEGIN still needs a rollback.
        self.open = true;
        let client = self.client()?;
        client.batch_execute(&sql).map_err(convert_error)
    }

    fn client(&mut self) -> Result<&mut Client> {
        self.client
            .as_deref_mut()
            .ok_or_else(|| BackendError::connection("no connection"))
    }

    fn end(&mut self, sql: &str) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.client()?.batch_execute(sql).map_err(convert_error)
    }
}

impl NativeTx for PgSession {
    fn commit(&mut self) -> Result<()> {
        self.end("COMMIT")
    }

    fn rollback(&mut self) -> Result<()> {
        self.end("ROLLBACK")
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.end("ROLLBACK") {
                debug!(error = %err, "rollback on drop failed");
            }
        }
    }
}

/// Transaction against a PostgreSQL database
pub struct PgTx {
    session: PgSession,
    state: TxState,
    ctx: Context,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PgTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgTx")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl PgTx {
    pub(crate) fn start(
        client: PooledClient,
        ctx: &Context,
        clock: Arc<dyn Clock>,
        read_only: bool,
    ) -> Self {
        match PgSession::begin(client, read_only, ctx.remaining()) {
            Ok(session) => PgTx {
                session,
                state: TxState::active(read_only),
                ctx: ctx.clone(),
                clock,
            },
            Err((session, err)) => PgTx {
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
        PgTx {
            session: PgSession::detached(),
            state: TxState::failed(err, read_only),
            ctx: ctx.clone(),
            clock,
        }
    }

    fn exec<T, F>(&mut self, op: &'static str, access: Access, f: F) -> Result<T>
    where
        F: FnOnce(&mut Client, SystemTime) -> Result<T>,
    {
        let now = self.clock.now().to_system_time();
        self.state
            .run(&mut self.session, &self.ctx, op, access, |session| {
                f(session.client()?, now)
            })
    }
}

fn expires_param(expires: Option<Timestamp>) -> Option<SystemTime> {
    expires.map(Timestamp::to_system_time)
}

fn expires_column(row: &Row, idx: usize) -> Result<Option<Timestamp>> {
    let value: Option<SystemTime> = row.try_get(idx).map_err(convert_error)?;
    Ok(value.map(Timestamp::from_system_time))
}

fn lease_from_row(row: &Row) -> Result<Lease> {
    Ok(Lease {
        key: row.try_get(0).map_err(convert_error)?,
        id: row.try_get(1).map_err(convert_error)?,
        expires: expires_column(row, 2)?,
    })
}

fn item_from_row(row: &Row) -> Result<Item> {
    Ok(Item {
        key: row.try_get(0).map_err(convert_error)?,
        value: row.try_get(1).map_err(convert_error)?,
        id: row.try_get(2).map_err(convert_error)?,
        expires: expires_column(row, 3)?,
    })
}

fn event_from_row(row: &Row) -> Result<Event> {
    let event_id: i64 = row.try_get(0).map_err(convert_error)?;
    let kind: i16 = row.try_get(1).map_err(convert_error)?;
    let op = OpType::from_i16(kind).ok_or_else(|| {
        BackendError::engine(format!("event {event_id} has unknown type {kind}"))
    })?;
    let value: Option<Vec<u8>> = row.try_get(5).map_err(convert_error)?;
    Ok(Event {
        event_id,
        op,
        item: Item {
            key: row.try_get(2).map_err(convert_error)?,
            id: row.try_get(3).map_err(convert_error)?,
            expires: expires_column(row, 4)?,
            value: value.unwrap_or_default(),
        },
    })
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

const SELECT_CURRENT_ITEM: &str = "SELECT lease.key, item.value, lease.id, lease.expires \
     FROM lease JOIN item ON item.key = lease.key AND item.id = lease.id";

impl Transaction for PgTx {
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
        self.exec("delete_events", Access::Write, |client, _| {
            client
                .execute("DELETE FROM event WHERE eventid <= $1", &[&before_event_id])
                .map_err(convert_error)
        })
    }

    fn delete_expired_leases(&mut self) -> Result<u64> {
        self.exec("delete_expired_leases", Access::Write, |client, now| {
            client
                .execute(
                    "DELETE FROM lease WHERE expires IS NOT NULL AND expires <= $1",
                    &[&now],
                )
                .map_err(convert_error)
        })
    }

    fn delete_items(&mut self, before_event_id: i64) -> Result<u64> {
        self.exec("delete_items", Access::Write, |client, _| {
            client
                .execute(
                    "DELETE FROM item WHERE NOT EXISTS (
                        SELECT 1 FROM lease WHERE lease.key = item.key AND lease.id = item.id
                     ) AND NOT EXISTS (
                        SELECT 1 FROM event WHERE event.key = item.key AND event.id = item.id
                        AND event.eventid > $1
                     )",
                    &[&before_event_id],
                )
                .map_err(convert_error)
        })
    }

    fn delete_lease(&mut self, key: &[u8]) -> Result<Option<i64>> {
        self.exec("delete_lease", Access::Write, |client, _| {
            let row = client
                .query_opt("DELETE FROM lease WHERE key = $1 RETURNING id", &[&key])
                .map_err(convert_error)?;
            match row {
                Some(row) => Ok(Some(row.try_get(0).map_err(convert_error)?)),
                None => Ok(None),
            }
        })
    }

    fn delete_lease_range(&mut self, start_key: &[u8], end_key: &[u8]) -> Result<Vec<Lease>> {
        self.exec("delete_lease_range", Access::Write, |client, _| {
            let rows = client
                .query(
                    "DELETE FROM lease WHERE key BETWEEN $1 AND $2 RETURNING key, id, expires",
                    &[&start_key, &end_key],
                )
                .map_err(convert_error)?;
            let mut leases = rows.iter().map(lease_from_row).collect::<Result<Vec<_>>>()?;
            leases.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(leases)
        })
    }

    fn get_events(&mut self, from_event_id: i64, limit: usize) -> Result<EventBatch> {
        self.exec("get_events", Access::Read, |client, _| {
            let rows = client
                .query(
                    "SELECT event.eventid, event.type, event.key, event.id, event.expires, item.value
                     FROM event LEFT JOIN item ON item.key = event.key AND item.id = event.id
                     WHERE event.eventid > $1 ORDER BY event.eventid LIMIT $2",
                    &[&from_event_id, &sql_limit(limit)],
                )
                .map_err(convert_error)?;
            let events = rows.iter().map(event_from_row).collect::<Result<Vec<_>>>()?;
            Ok(EventBatch::from_events(from_event_id, events))
        })
    }

    fn get_expired_leases(&mut self) -> Result<Vec<Lease>> {
        self.exec("get_expired_leases", Access::Read, |client, now| {
            let rows = client
                .query(
                    "SELECT key, id, expires FROM lease
                     WHERE expires IS NOT NULL AND expires <= $1 ORDER BY key",
                    &[&now],
                )
                .map_err(convert_error)?;
            rows.iter().map(lease_from_row).collect()
        })
    }

    fn get_item(&mut self, key: &[u8]) -> Result<Option<Item>> {
        self.exec("get_item", Access::Read, |client, now| {
            let row = client
                .query_opt(
                    format!(
                        "{SELECT_CURRENT_ITEM} WHERE lease.key = $1 \
                         AND (lease.expires IS NULL OR lease.expires > $2)"
                    )
                    .as_str(),
                    &[&key, &now],
                )
                .map_err(convert_error)?;
            row.as_ref().map(item_from_row).transpose()
        })
    }

    fn get_item_range(
        &mut self,
        start_key: &[u8],
        end_key: &[u8],
        limit: usize,
    ) -> Result<Vec<Item>> {
        self.exec("get_item_range", Access::Read, |client, now| {
            let rows = client
                .query(
                    format!(
                        "{SELECT_CURRENT_ITEM} WHERE lease.key BETWEEN $1 AND $2 \
                         AND (lease.expires IS NULL OR lease.expires > $3) \
                         ORDER BY lease.key LIMIT $4"
                    )
                    .as_str(),
                    &[&start_key, &end_key, &now, &sql_limit(limit)],
                )
                .map_err(convert_error)?;
            rows.iter().map(item_from_row).collect()
        })
    }

    fn get_item_value(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.exec("get_item_value", Access::Read, |client, now| {
            let row = client
                .query_opt(
                    "SELECT item.value FROM lease
                     JOIN item ON item.key = lease.key AND item.id = lease.id
                     WHERE lease.key = $1 AND (lease.expires IS NULL OR lease.expires > $2)",
                    &[&key, &now],
                )
                .map_err(convert_error)?;
            match row {
                Some(row) => Ok(Some(row.try_get(0).map_err(convert_error)?)),
                None => Ok(None),
            }
        })
    }

    fn get_last_event_id(&mut self) -> Result<i64> {
        self.exec("get_last_event_id", Access::Read, |client, _| {
            client
                .query_one("SELECT COALESCE(MAX(eventid), 0)::BIGINT FROM event", &[])
                .and_then(|row| row.try_get(0))
                .map_err(convert_error)
        })
    }

    fn insert_event(&mut self, op: OpType, item: &Item) -> Result<()> {
        self.exec("insert_event", Access::Write, |client, now| {
            client
                .execute("SELECT pg_advisory_xact_lock($1)", &[&EVENT_LOCK])
                .map_err(convert_error)?;
            client
                .execute(
                    "INSERT INTO event (created, key, id, type, expires)
                     VALUES ($1, $2, $3, $4, $5)",
                    &[
                        &now,
                        &item.key,
                        &item.id,
                        &op.as_i16(),
                        &expires_param(item.expires),
                    ],
                )
                .map_err(convert_error)?;
            Ok(())
        })
    }

    fn insert_item(&mut self, item: &Item) -> Result<i64> {
        let id = new_id();
        self.exec("insert_item", Access::Write, |client, _| {
            client
                .execute(
                    "INSERT INTO item (key, id, value) VALUES ($1, $2, $3)",
                    &[&item.key, &id, &item.value],
                )
                .map_err(convert_error)?;
            Ok(id)
        })
    }

    fn lease_exists(&mut self, key: &[u8]) -> Result<bool> {
        self.exec("lease_exists", Access::Read, |client, now| {
            client
                .query_one(
                    "SELECT EXISTS (SELECT 1 FROM lease
                     WHERE key = $1 AND (expires IS NULL OR expires > $2))",
                    &[&key, &now],
                )
                .and_then(|row| row.try_get(0))
                .map_err(convert_error)
        })
    }

    fn update_lease(&mut self, item: &Item) -> Result<()> {
        self.exec("update_lease", Access::Write, |client, _| {
            let n = client
                .execute(
                    "UPDATE lease SET id = $2, expires = $3 WHERE key = $1",
                    &[&item.key, &item.id, &expires_param(item.expires)],
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
        self.exec("upsert_lease", Access::Write, |client, _| {
            client
                .execute(
                    "INSERT INTO lease (key, id, expires) VALUES ($1, $2, $3)
                     ON CONFLICT (key) DO UPDATE SET id = EXCLUDED.id, expires = EXCLUDED.expires",
                    &[&item.key, &item.id, &expires_param(item.expires)],
                )
                .map_err(convert_error)?;
            Ok(())
        })
    }
}
