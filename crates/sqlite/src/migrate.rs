//! Schema migrations
//!
//! Each entry of [`MIGRATIONS`] is applied once, in order, inside its own
//! IMMEDIATE transaction, and recorded in the `migrate` table. Timestamps are
//! stored as INTEGER microseconds since the Unix epoch.

use relkv_core::{BackendError, Result, Timestamp};
use rusqlite::{params, Connection, TransactionBehavior};
use tracing::info;

const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE item (
    key BLOB NOT NULL,
    id INTEGER NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (key, id)
);
CREATE TABLE lease (
    key BLOB NOT NULL PRIMARY KEY,
    id INTEGER NOT NULL,
    expires INTEGER,
    FOREIGN KEY (key, id) REFERENCES item (key, id)
);
CREATE INDEX lease_expires ON lease (expires);
CREATE TABLE event (
    eventid INTEGER PRIMARY KEY AUTOINCREMENT,
    created INTEGER NOT NULL,
    key BLOB NOT NULL,
    id INTEGER NOT NULL,
    type INTEGER NOT NULL,
    expires INTEGER
);
CREATE INDEX event_item ON event (key, id);
"#];

/// Latest schema version
pub const SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;

fn migration_error(err: rusqlite::Error) -> BackendError {
    BackendError::migration(err.to_string())
}

/// Bring the schema up to [`SCHEMA_VERSION`]
pub fn migrate(conn: &mut Connection, now: Timestamp) -> Result<i64> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrate (
            version INTEGER NOT NULL PRIMARY KEY,
            created INTEGER NOT NULL
        )",
    )
    .map_err(migration_error)?;

    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let version = idx as i64 + 1;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(migration_error)?;
        let current: i64 = tx
            .query_row("SELECT COALESCE(MAX(version), 0) FROM migrate", [], |row| {
                row.get(0)
            })
            .map_err(migration_error)?;
        if current >= version {
            continue;
        }
        tx.execute_batch(sql).map_err(migration_error)?;
        tx.execute(
            "INSERT INTO migrate (version, created) VALUES (?1, ?2)",
            params![version, now.as_sql_micros()],
        )
        .map_err(migration_error)?;
        tx.commit().map_err(migration_error)?;
        info!(version, "applied schema migration");
    }
    Ok(SCHEMA_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(migrate(&mut conn, Timestamp::from_secs(1)).unwrap(), 1);
        assert_eq!(migrate(&mut conn, Timestamp::from_secs(2)).unwrap(), 1);

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrate", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
        let created: i64 = conn
            .query_row("SELECT created FROM migrate WHERE version = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(created, 1_000_000);
    }

    #[test]
    fn test_tables_exist() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn, Timestamp::from_secs(1)).unwrap();
        for table in ["item", "lease", "event"] {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(n, 1, "missing table {table}");
        }
    }
}
