//! Driver, connection and transaction contracts
//!
//! These traits decouple the backend logic from a specific relational engine:
//!
//! - [`Driver`]: names the engine, owns the validated configuration, opens a
//!   [`Connection`]
//! - [`Connection`]: a pooled handle to one database instance that starts
//!   read-write or read-only transactions
//! - [`Transaction`]: one unit of work exposing the fixed data-plane operation
//!   set
//!
//! A transaction is Active until `commit` or `rollback`, or until any call
//! fails. A failed transaction latches the error: every later call returns it
//! without touching the engine, and `commit` returns it too. A transaction is
//! owned by exactly one caller and is never shared between threads while in
//! use.

use crate::config::Config;
use crate::context::Context;
use crate::error::{BackendError, Result};
use crate::types::{EventBatch, Item, Lease, OpType};

/// Engine-specific backend implementation
pub trait Driver: Send + Sync + 'static {
    /// Connection type produced by [`Driver::open`]
    type Conn: Connection;

    /// Name of the engine behind this driver
    fn backend_name(&self) -> &'static str;

    /// Validated backend configuration
    fn config(&self) -> &Config;

    /// Open a connection pool, applying pending schema migrations.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the engine is unreachable and `Migration` if
    /// the schema cannot be brought up to date. Neither is retried.
    fn open(&self, ctx: &Context) -> Result<Self::Conn>;
}

/// Pooled handle to one database instance
pub trait Connection: Send + Sync + 'static {
    /// Transaction type produced by this connection
    type Tx: Transaction;

    /// Begin a read-write transaction.
    ///
    /// Never fails directly: a transaction that could not be started is
    /// returned already Failed. Cancelling `ctx` rolls it back.
    fn begin(&self, ctx: &Context) -> Self::Tx;

    /// Begin a read-only transaction. Mutating calls fail the transaction
    /// with [`BackendError::ReadOnly`].
    fn read_only(&self, ctx: &Context) -> Self::Tx;

    /// Close the pool. Transactions begun afterwards start Failed.
    fn close(&self) -> Result<()>;
}

/// Unit of work against the engine
///
/// Every operation takes effect inside this transaction. A failing operation
/// returns its error and also moves the transaction to Failed; `err()`
/// reports the latched error.
pub trait Transaction: Send {
    /// Latched error, `None` while Active or after a successful commit
    fn err(&self) -> Option<&BackendError>;

    /// Commit. Returns the latched error if the transaction already failed.
    fn commit(&mut self) -> Result<()>;

    /// Roll back and latch `err`, returning it.
    ///
    /// When the transaction is already Failed the latched error is replaced
    /// and the rollback is still attempted.
    fn rollback(&mut self, err: BackendError) -> BackendError;

    /// Delete events with `event_id <= before_event_id`
    fn delete_events(&mut self, before_event_id: i64) -> Result<u64>;

    /// Delete leases whose expiry is set and at or before now. Idempotent.
    fn delete_expired_leases(&mut self) -> Result<u64>;

    /// Delete items no longer bound by a lease and not referenced by any
    /// event with `event_id > before_event_id`
    fn delete_items(&mut self, before_event_id: i64) -> Result<u64>;

    /// Delete the lease for `key`, returning the item ID it bound, or `None`
    /// when no lease existed. Idempotent.
    fn delete_lease(&mut self, key: &[u8]) -> Result<Option<i64>>;

    /// Delete every lease with `start_key <= key <= end_key`, returning the
    /// removed bindings
    fn delete_lease_range(&mut self, start_key: &[u8], end_key: &[u8]) -> Result<Vec<Lease>>;

    /// Events with `event_id > from_event_id` in ascending order, at most
    /// `limit`. An empty page leaves `last_event_id` at `from_event_id`.
    fn get_events(&mut self, from_event_id: i64, limit: usize) -> Result<EventBatch>;

    /// Leases whose expiry is set and at or before now
    fn get_expired_leases(&mut self) -> Result<Vec<Lease>>;

    /// Current item for `key`, `None` if missing or expired
    fn get_item(&mut self, key: &[u8]) -> Result<Option<Item>>;

    /// Current items with `start_key <= key <= end_key`, ascending by key,
    /// excluding expired items, at most `limit`
    fn get_item_range(&mut self, start_key: &[u8], end_key: &[u8], limit: usize)
        -> Result<Vec<Item>>;

    /// Current value for `key`, `None` if missing or expired
    fn get_item_value(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Highest event ID, zero when the log is empty
    fn get_last_event_id(&mut self) -> Result<i64>;

    /// Append an event of kind `op` for `item`
    fn insert_event(&mut self, op: OpType, item: &Item) -> Result<()>;

    /// Insert `item` under a newly generated ID and return the ID.
    ///
    /// Fails with `AlreadyExists` if the ID is already taken for the key.
    fn insert_item(&mut self, item: &Item) -> Result<i64>;

    /// True if an unexpired lease exists for `key`
    fn lease_exists(&mut self, key: &[u8]) -> Result<bool>;

    /// Rebind an existing lease to `item.id`/`item.expires`.
    ///
    /// Fails with `NotFound` if no lease exists for the key.
    fn update_lease(&mut self, item: &Item) -> Result<()>;

    /// Create or rebind the lease for `item.key`
    fn upsert_lease(&mut self, item: &Item) -> Result<()>;
}
