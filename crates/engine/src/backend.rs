//! Key/value backend
//!
//! [`Backend`] turns the data-plane operations of a [`Driver`] into the
//! operations a key/value consumer needs. Every operation runs in a single
//! transaction that is retried from scratch on Retryable errors.
//!
//! # Example
//!
//! ```ignore
//! use relkv_engine::{Backend, EventBuffer};
//! use relkv_sqlite::{SqliteConfig, SqliteDriver};
//!
//! let buffer = EventBuffer::new(1024);
//! let driver = SqliteDriver::new(SqliteConfig::new("/var/lib/relkv/relkv.db"));
//! let backend = Backend::new(driver, Arc::new(buffer.clone()), &Context::background())?;
//!
//! let mut watcher = buffer.watch();
//! backend.put(&ctx, Item::new("a", "1"))?;
//! let event = watcher.recv_timeout(Duration::from_secs(2))?;
//! ```

use crate::background::{Scheduler, Watermark};
use crate::buffer::EventSink;
use crate::retry::retry_tx;
use parking_lot::Mutex;
use relkv_core::{
    BackendError, Config, Connection, Context, Driver, Item, Lease, OpType, Result, Timestamp,
    Transaction,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

type TxOf<D> = <<D as Driver>::Conn as Connection>::Tx;

fn key_display(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

/// Insert `item` under a fresh ID.
///
/// A taken ID only means another writer generated the same one, so the
/// collision is reported as Retryable and the whole transaction re-runs with
/// a new ID. AlreadyExists from the facade's own preconditions is unaffected.
fn insert_fresh_item<T: Transaction>(tx: &mut T, item: &Item) -> Result<i64> {
    tx.insert_item(item).map_err(|err| {
        if err.is_already_exists() {
            BackendError::retryable(format!(
                "item id collision for key {:?}: {}",
                key_display(&item.key),
                err
            ))
        } else {
            err
        }
    })
}

/// Key/value store with TTL expiry and an ordered change-event stream
pub struct Backend<D: Driver> {
    driver: D,
    conn: Arc<D::Conn>,
    watermark: Watermark,
    close_ctx: Context,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<D: Driver> std::fmt::Debug for Backend<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("backend", &self.driver.backend_name())
            .field("watermark", &self.watermark.get())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<D: Driver> Backend<D> {
    /// Open the database, seed the event watermark and start the background
    /// worker.
    ///
    /// # Errors
    ///
    /// Any failure here is fatal and not retried: an unreachable engine, a
    /// failed migration or a failure reading the starting watermark.
    pub fn new(driver: D, sink: Arc<dyn EventSink>, ctx: &Context) -> Result<Self> {
        let conn = Arc::new(driver.open(ctx)?);
        let scheduler = Scheduler::start(Arc::clone(&conn), sink, driver.config(), ctx)?;
        let watermark = scheduler.watermark();
        let close_ctx = Context::background();
        let worker = scheduler.spawn(close_ctx.clone())?;
        info!(backend = driver.backend_name(), "backend started");

        Ok(Self {
            driver,
            conn,
            watermark,
            close_ctx,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
        })
    }

    /// Driver this backend runs on
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Validated configuration
    pub fn config(&self) -> &Config {
        self.driver.config()
    }

    /// Shared connection pool
    pub fn connection(&self) -> &Arc<D::Conn> {
        &self.conn
    }

    /// Highest EventID delivered to the sink
    pub fn watermark(&self) -> i64 {
        self.watermark.get()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackendError::connection("backend is closed"));
        }
        Ok(())
    }

    /// Run `f` in a read-write transaction, retrying on conflicts
    fn write<T, F>(&self, ctx: &Context, mut f: F) -> Result<T>
    where
        F: FnMut(&mut TxOf<D>) -> Result<T>,
    {
        self.check_open()?;
        retry_tx(ctx, self.config().retry_delay_period, || {
            let mut tx = self.conn.begin(ctx);
            match f(&mut tx) {
                Ok(v) => {
                    tx.commit()?;
                    Ok(v)
                }
                Err(err) => Err(tx.rollback(err)),
            }
        })
    }

    fn read<T, F>(&self, ctx: &Context, mut f: F) -> Result<T>
    where
        F: FnMut(&mut TxOf<D>) -> Result<T>,
    {
        self.check_open()?;
        retry_tx(ctx, self.config().retry_delay_period, || {
            let mut tx = self.conn.read_only(ctx);
            match f(&mut tx) {
                Ok(v) => {
                    tx.commit()?;
                    Ok(v)
                }
                Err(err) => Err(tx.rollback(err)),
            }
        })
    }

    /// Store `item` only if no live value exists for its key
    pub fn create(&self, ctx: &Context, item: Item) -> Result<Item> {
        self.write(ctx, |tx| {
            if tx.lease_exists(&item.key)? {
                return Err(BackendError::already_exists(format!(
                    "key {:?} already exists",
                    key_display(&item.key)
                )));
            }
            let mut stored = item.clone();
            stored.id = insert_fresh_item(tx, &stored)?;
            tx.upsert_lease(&stored)?;
            tx.insert_event(OpType::Put, &stored)?;
            Ok(stored)
        })
    }

    /// Store `item`, replacing any current value
    pub fn put(&self, ctx: &Context, item: Item) -> Result<Item> {
        self.write(ctx, |tx| {
            let mut stored = item.clone();
            stored.id = insert_fresh_item(tx, &stored)?;
            tx.upsert_lease(&stored)?;
            tx.insert_event(OpType::Put, &stored)?;
            Ok(stored)
        })
    }

    /// Replace the live value for `item.key`
    pub fn update(&self, ctx: &Context, item: Item) -> Result<Item> {
        self.write(ctx, |tx| {
            if !tx.lease_exists(&item.key)? {
                return Err(BackendError::not_found(format!(
                    "key {:?} not found",
                    key_display(&item.key)
                )));
            }
            let mut stored = item.clone();
            stored.id = insert_fresh_item(tx, &stored)?;
            tx.update_lease(&stored)?;
            tx.insert_event(OpType::Put, &stored)?;
            Ok(stored)
        })
    }

    /// Replace the live value with `replace` if it currently equals
    /// `expected.value`
    pub fn compare_and_swap(&self, ctx: &Context, expected: &Item, replace: Item) -> Result<Item> {
        if expected.key != replace.key {
            return Err(BackendError::bad_parameter(
                "expected and replacement keys differ",
            ));
        }
        self.write(ctx, |tx| {
            let current = tx.get_item_value(&expected.key)?.ok_or_else(|| {
                BackendError::not_found(format!("key {:?} not found", key_display(&expected.key)))
            })?;
            if current != expected.value {
                return Err(BackendError::compare_failed(format!(
                    "value of key {:?} changed",
                    key_display(&expected.key)
                )));
            }
            let mut stored = replace.clone();
            stored.id = insert_fresh_item(tx, &stored)?;
            tx.update_lease(&stored)?;
            tx.insert_event(OpType::Put, &stored)?;
            Ok(stored)
        })
    }

    /// Live item for `key`
    pub fn get(&self, ctx: &Context, key: &[u8]) -> Result<Item> {
        self.read(ctx, |tx| {
            tx.get_item(key)?.ok_or_else(|| {
                BackendError::not_found(format!("key {:?} not found", key_display(key)))
            })
        })
    }

    /// Live items with `start <= key <= end` in key order. A zero `limit`
    /// returns every match.
    pub fn get_range(
        &self,
        ctx: &Context,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<Item>> {
        let limit = if limit == 0 { usize::MAX } else { limit };
        self.read(ctx, |tx| tx.get_item_range(start, end, limit))
    }

    /// Remove the live value for `key`
    pub fn delete(&self, ctx: &Context, key: &[u8]) -> Result<()> {
        self.write(ctx, |tx| {
            let current = tx.get_item(key)?;
            let removed = tx.delete_lease(key)?;
            match (current, removed) {
                (Some(item), Some(_)) => tx.insert_event(OpType::Delete, &item),
                _ => Err(BackendError::not_found(format!(
                    "key {:?} not found",
                    key_display(key)
                ))),
            }
        })
    }

    /// Remove every value with `start <= key <= end`, returning how many
    /// were removed
    pub fn delete_range(&self, ctx: &Context, start: &[u8], end: &[u8]) -> Result<usize> {
        self.write(ctx, |tx| {
            let removed = tx.delete_lease_range(start, end)?;
            for lease in &removed {
                let item = Item {
                    key: lease.key.clone(),
                    value: Vec::new(),
                    id: lease.id,
                    expires: lease.expires,
                };
                tx.insert_event(OpType::Delete, &item)?;
            }
            Ok(removed.len())
        })
    }

    /// Move the expiry of a live lease. `lease.id` must still be current.
    pub fn keep_alive(
        &self,
        ctx: &Context,
        lease: &Lease,
        expires: Option<Timestamp>,
    ) -> Result<()> {
        self.write(ctx, |tx| {
            let mut item = match tx.get_item(&lease.key)? {
                Some(item) if item.id == lease.id => item,
                _ => {
                    return Err(BackendError::not_found(format!(
                        "lease for key {:?} not found",
                        key_display(&lease.key)
                    )))
                }
            };
            item.expires = expires;
            tx.update_lease(&item)?;
            tx.insert_event(OpType::Put, &item)
        })
    }

    /// Stop the background worker and close the pool. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.close_ctx.cancel();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("background worker panicked");
            }
        }
        self.conn.close()?;
        info!(backend = self.driver.backend_name(), "backend closed");
        Ok(())
    }
}

impl<D: Driver> Drop for Backend<D> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to close backend");
        }
    }
}
