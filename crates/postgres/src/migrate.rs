//! Schema migrations
//!
//! Every process that opens the database runs [`migrate`]. Each pending
//! migration is applied in its own transaction under a transaction-scoped
//! advisory lock, so concurrent openers apply it exactly once.

use postgres::Client;
use relkv_core::{BackendError, Result, Timestamp};
use tracing::info;

/// Advisory lock key held while migrating
const MIGRATE_LOCK: i64 = 0x72_6c_6b_76_6d_69_67;

const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE item (
    key BYTEA NOT NULL,
    id BIGINT NOT NULL,
    value BYTEA NOT NULL,
    PRIMARY KEY (key, id)
);
CREATE TABLE lease (
    key BYTEA NOT NULL PRIMARY KEY,
    id BIGINT NOT NULL,
    expires TIMESTAMPTZ,
    FOREIGN KEY (key, id) REFERENCES item (key, id)
);
CREATE INDEX lease_expires ON lease (expires);
CREATE TABLE event (
    eventid BIGSERIAL PRIMARY KEY,
    created TIMESTAMPTZ NOT NULL,
    key BYTEA NOT NULL,
    id BIGINT NOT NULL,
    type SMALLINT NOT NULL,
    expires TIMESTAMPTZ
);
CREATE INDEX event_item ON event (key, id);
"#];

/// Latest schema version
pub const SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;

fn migration_error(err: postgres::Error) -> BackendError {
    BackendError::migration(err.to_string())
}

/// Bring the schema up to [`SCHEMA_VERSION`]
pub fn migrate(client: &mut Client, now: Timestamp) -> Result<i64> {
    for (idx, sql) in MIGRATIONS.iter().enumerate() {
        let version = idx as i64 + 1;
        let mut tx = client.transaction().map_err(migration_error)?;
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&MIGRATE_LOCK])
            .map_err(migration_error)?;
        tx.batch_execute(
            "CREATE TABLE IF NOT EXISTS migrate (
                version BIGINT NOT NULL PRIMARY KEY,
                created TIMESTAMPTZ NOT NULL
            )",
        )
        .map_err(migration_error)?;
        let current: i64 = tx
            .query_one("SELECT COALESCE(MAX(version), 0) FROM migrate", &[])
            .and_then(|row| row.try_get(0))
            .map_err(migration_error)?;
        if current >= version {
            continue;
        }
        tx.batch_execute(sql).map_err(migration_error)?;
        tx.execute(
            "INSERT INTO migrate (version, created) VALUES ($1, $2)",
            &[&version, &now.to_system_time()],
        )
        .map_err(migration_error)?;
        tx.commit().map_err(migration_error)?;
        info!(version, "applied schema migration");
    }
    Ok(SCHEMA_VERSION)
}
