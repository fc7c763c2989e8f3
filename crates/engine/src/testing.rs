//! Driver compliance suite
//!
//! Adapters run [`run_compliance_suite`] from their own test suites to check
//! the data-plane contracts against a real engine. Keys are prefixed with a
//! fresh ID per check, so the suite can run against a shared database.
//!
//! ```ignore
//! let dirs = RefCell::new(Vec::new());
//! run_compliance_suite(|clock| {
//!     let dir = tempfile::tempdir().unwrap();
//!     let cfg = SqliteConfig::new(dir.path().join("relkv.db")).with_clock(clock);
//!     dirs.borrow_mut().push(dir);
//!     SqliteDriver::new(cfg)
//! })?;
//! ```

use crate::background::Scheduler;
use crate::buffer::EventSink;
use parking_lot::Mutex;
use relkv_core::{
    new_id, BackendError, Clock, Connection, Context, Driver, Event, Item, ManualClock, OpType,
    Result, Transaction,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Sink that records every emitted event
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Event>>,
    init: AtomicBool,
}

impl CollectingSink {
    /// Events received so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// True once `set_init` was called
    pub fn is_init(&self) -> bool {
        self.init.load(Ordering::Acquire)
    }
}

impl EventSink for CollectingSink {
    fn set_init(&self) {
        self.init.store(true, Ordering::Release);
    }

    fn emit(&self, events: Vec<Event>) {
        self.events.lock().extend(events);
    }
}

/// Builds a driver for a fresh (or shared) database using `clock`
pub type DriverFactory<'a, D> = dyn FnMut(Arc<ManualClock>) -> D + 'a;

fn ensure(cond: bool, what: &str) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(BackendError::engine(format!("compliance check failed: {what}")))
    }
}

fn key(prefix: &str, suffix: &str) -> Vec<u8> {
    format!("{prefix}{suffix}").into_bytes()
}

struct Fixture<D: Driver> {
    clock: Arc<ManualClock>,
    conn: Arc<D::Conn>,
    driver: D,
    prefix: String,
    ctx: Context,
}

impl<D: Driver> Fixture<D> {
    fn new(factory: &mut DriverFactory<'_, D>) -> Result<Self> {
        let clock = Arc::new(ManualClock::starting_now());
        let driver = factory(Arc::clone(&clock));
        let ctx = Context::background();
        let conn = Arc::new(driver.open(&ctx)?);
        Ok(Self {
            clock,
            conn,
            driver,
            prefix: format!("compliance/{}/", new_id()),
            ctx,
        })
    }

    fn key(&self, suffix: &str) -> Vec<u8> {
        key(&self.prefix, suffix)
    }

    fn put(&self, item: Item) -> Result<Item> {
        let mut tx = self.conn.begin(&self.ctx);
        let mut item = item;
        item.id = tx.insert_item(&item)?;
        tx.upsert_lease(&item)?;
        tx.insert_event(OpType::Put, &item)?;
        tx.commit()?;
        Ok(item)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Item>> {
        let mut tx = self.conn.read_only(&self.ctx);
        let item = tx.get_item(key)?;
        tx.commit()?;
        Ok(item)
    }
}

/// Run every compliance check, stopping at the first failure
pub fn run_compliance_suite<D, F>(mut factory: F) -> Result<()>
where
    D: Driver,
    F: FnMut(Arc<ManualClock>) -> D,
{
    let checks: [(&str, fn(&mut DriverFactory<'_, D>) -> Result<()>); 9] = [
        ("lazy_expiry", check_lazy_expiry),
        ("latest_value_wins", check_latest_value_wins),
        ("event_order", check_event_order),
        ("expired_lease_cleanup", check_expired_lease_cleanup),
        ("range", check_range),
        ("read_only", check_read_only),
        ("failed_tx_latches", check_failed_tx_latches),
        ("expiry_scenario", check_expiry_scenario),
        ("purge_safety", check_purge_safety),
    ];
    for (name, check) in checks {
        info!(check = name, "running compliance check");
        check(&mut factory).map_err(|err| BackendError::engine(format!("{name}: {err}")))?;
    }
    Ok(())
}

fn check_lazy_expiry<D: Driver>(factory: &mut DriverFactory<'_, D>) -> Result<()> {
    let fx = Fixture::new(factory)?;
    let key = fx.key("ttl");
    let expires = fx.clock.now().saturating_add(Duration::from_secs(2));
    fx.put(Item::new(key.clone(), "1").with_expires(expires))?;
    ensure(fx.get(&key)?.is_some(), "item visible before expiry")?;

    fx.clock.advance(Duration::from_secs(2));
    ensure(fx.get(&key)?.is_none(), "item absent at expiry")?;
    let mut tx = fx.conn.read_only(&fx.ctx);
    ensure(!tx.lease_exists(&key)?, "lease reported absent at expiry")?;
    ensure(tx.get_item_value(&key)?.is_none(), "value absent at expiry")?;
    tx.commit()
}

fn check_latest_value_wins<D: Driver>(factory: &mut DriverFactory<'_, D>) -> Result<()> {
    let fx = Fixture::new(factory)?;
    let key = fx.key("k");
    fx.put(Item::new(key.clone(), "1"))?;
    let second = fx.put(Item::new(key.clone(), "2"))?;

    let current = fx.get(&key)?;
    ensure(
        current.as_ref().map(|i| i.value.as_slice()) == Some(b"2".as_slice()),
        "get returns the last committed value",
    )?;
    ensure(
        current.map(|i| i.id) == Some(second.id),
        "lease points at the newest item",
    )?;

    let mut tx = fx.conn.read_only(&fx.ctx);
    let items = tx.get_item_range(&key, &key, 10)?;
    tx.commit()?;
    ensure(items.len() == 1, "one lease per key")
}

fn check_event_order<D: Driver>(factory: &mut DriverFactory<'_, D>) -> Result<()> {
    let fx = Fixture::new(factory)?;
    let mut tx = fx.conn.read_only(&fx.ctx);
    let start = tx.get_last_event_id()?;
    tx.commit()?;

    let keys: Vec<_> = (0..5).map(|i| fx.key(&i.to_string())).collect();
    for key in &keys {
        fx.put(Item::new(key.clone(), "v"))?;
    }

    let mut tx = fx.conn.read_only(&fx.ctx);
    let batch = tx.get_events(start, 1000)?;
    tx.commit()?;
    let ours: Vec<_> = batch
        .events
        .iter()
        .filter(|e| e.item.key.starts_with(fx.prefix.as_bytes()))
        .collect();
    ensure(ours.len() == keys.len(), "one event per committed put")?;
    ensure(
        ours.iter().map(|e| &e.item.key).eq(keys.iter()),
        "events follow commit order",
    )?;
    ensure(
        batch.events.windows(2).all(|w| w[0].event_id < w[1].event_id),
        "event IDs strictly increase",
    )?;
    ensure(
        batch.last_event_id == batch.events.last().map_or(start, |e| e.event_id),
        "last_event_id matches the final event",
    )
}

fn check_expired_lease_cleanup<D: Driver>(factory: &mut DriverFactory<'_, D>) -> Result<()> {
    let fx = Fixture::new(factory)?;
    let soon = fx.clock.now().saturating_add(Duration::from_secs(1));
    fx.put(Item::new(fx.key("x"), "1").with_expires(soon))?;
    fx.put(Item::new(fx.key("y"), "2").with_expires(soon))?;
    fx.put(Item::new(fx.key("z"), "3"))?;
    fx.clock.advance(Duration::from_secs(1));

    let mut tx = fx.conn.begin(&fx.ctx);
    let expired = tx.get_expired_leases()?;
    ensure(
        expired
            .iter()
            .filter(|l| l.key.starts_with(fx.prefix.as_bytes()))
            .count()
            == 2,
        "expired leases listed",
    )?;
    ensure(tx.delete_expired_leases()? >= 2, "first sweep removes leases")?;
    ensure(tx.delete_expired_leases()? == 0, "second sweep removes nothing")?;
    ensure(tx.lease_exists(&fx.key("z"))?, "unexpiring lease kept")?;
    ensure(tx.delete_lease(&fx.key("x"))?.is_none(), "swept lease is gone")?;
    tx.commit()
}

fn check_range<D: Driver>(factory: &mut DriverFactory<'_, D>) -> Result<()> {
    let fx = Fixture::new(factory)?;
    for suffix in ["d", "b", "a", "c", "e"] {
        fx.put(Item::new(fx.key(suffix), suffix))?;
    }
    let soon = fx.clock.now().saturating_add(Duration::from_secs(1));
    fx.put(Item::new(fx.key("bb"), "gone").with_expires(soon))?;
    fx.clock.advance(Duration::from_secs(1));

    let mut tx = fx.conn.read_only(&fx.ctx);
    let items = tx.get_item_range(&fx.key("b"), &fx.key("d"), 100)?;
    let limited = tx.get_item_range(&fx.key("a"), &fx.key("e"), 2)?;
    tx.commit()?;

    let keys: Vec<_> = items.iter().map(|i| i.key.clone()).collect();
    ensure(
        keys == vec![fx.key("b"), fx.key("c"), fx.key("d")],
        "inclusive ascending range without expired keys",
    )?;
    let keys: Vec<_> = limited.iter().map(|i| i.key.clone()).collect();
    ensure(keys == vec![fx.key("a"), fx.key("b")], "range truncated at limit")?;

    let mut tx = fx.conn.begin(&fx.ctx);
    let removed = tx.delete_lease_range(&fx.key("a"), &fx.key("c"))?;
    tx.commit()?;
    let mut removed: Vec<_> = removed.into_iter().map(|l| l.key).collect();
    removed.sort();
    ensure(
        removed == vec![fx.key("a"), fx.key("b"), fx.key("bb"), fx.key("c")],
        "delete_lease_range removes the whole range",
    )
}

fn check_read_only<D: Driver>(factory: &mut DriverFactory<'_, D>) -> Result<()> {
    let fx = Fixture::new(factory)?;
    let mut tx = fx.conn.read_only(&fx.ctx);
    let err = tx.upsert_lease(&Item::new(fx.key("a"), "1"));
    ensure(
        matches!(err, Err(BackendError::ReadOnly(_))),
        "read-only rejects writes",
    )?;
    ensure(tx.err().is_some(), "read-only violation latches")?;
    ensure(tx.commit().is_err(), "commit after violation fails")?;
    ensure(fx.get(&fx.key("a"))?.is_none(), "rejected write left no trace")
}

fn check_failed_tx_latches<D: Driver>(factory: &mut DriverFactory<'_, D>) -> Result<()> {
    let fx = Fixture::new(factory)?;
    let key = fx.key("k");
    let mut tx = fx.conn.begin(&fx.ctx);
    let mut item = Item::new(key.clone(), "1");
    item.id = tx.insert_item(&item)?;
    let err = tx.update_lease(&item);
    ensure(
        matches!(&err, Err(e) if e.is_not_found()),
        "update_lease without lease is NotFound",
    )?;
    ensure(
        tx.get_last_event_id().err() == err.clone().err(),
        "later calls return the latched error",
    )?;
    let replaced = tx.rollback(BackendError::engine("abandoned"));
    ensure(
        tx.err() == Some(&replaced),
        "rollback replaces the latched error",
    )?;
    ensure(fx.get(&key)?.is_none(), "rolled back writes are invisible")
}

fn check_expiry_scenario<D: Driver>(factory: &mut DriverFactory<'_, D>) -> Result<()> {
    let fx = Fixture::new(factory)?;
    let sink = Arc::new(CollectingSink::default());
    let scheduler = Scheduler::start(
        Arc::clone(&fx.conn),
        sink.clone(),
        fx.driver.config(),
        &fx.ctx,
    )?;
    ensure(sink.is_init(), "sink signalled ready at start")?;

    let key = fx.key("a");
    let expires = fx.clock.now().saturating_add(Duration::from_secs(2));
    let stored = fx.put(Item::new(key.clone(), "1").with_expires(expires))?;
    fx.clock.advance(Duration::from_secs(3));
    ensure(fx.get(&key)?.is_none(), "lazy expiry before any cycle")?;

    scheduler.poll(&fx.ctx)?;
    let ops: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| e.item.key == key)
        .map(|e| (e.op, e.item.id))
        .collect();
    ensure(
        ops == vec![(OpType::Put, stored.id), (OpType::Delete, stored.id)],
        "poll emits the put and its expiry",
    )?;

    scheduler.poll(&fx.ctx)?;
    let deletes = sink
        .events()
        .iter()
        .filter(|e| e.item.key == key && e.op == OpType::Delete)
        .count();
    ensure(deletes == 1, "expiry reported once")?;

    let stats = scheduler.purge(&fx.ctx)?;
    ensure(stats.items >= 1, "purge removes the expired item")?;
    let mut tx = fx.conn.begin(&fx.ctx);
    ensure(!tx.lease_exists(&key)?, "lease gone after purge")?;
    ensure(tx.delete_lease(&key)?.is_none(), "no lease row after purge")?;
    let batch = tx.get_events(0, 1_000_000)?;
    tx.commit()?;
    ensure(
        !batch.events.iter().any(|e| e.item.key == key),
        "delivered events purged",
    )
}

fn check_purge_safety<D: Driver>(factory: &mut DriverFactory<'_, D>) -> Result<()> {
    let fx = Fixture::new(factory)?;
    let sink = Arc::new(CollectingSink::default());
    let scheduler = Scheduler::start(
        Arc::clone(&fx.conn),
        sink.clone(),
        fx.driver.config(),
        &fx.ctx,
    )?;
    let start = scheduler.watermark().get();

    let key = fx.key("k");
    let old = fx.put(Item::new(key.clone(), "old"))?;
    fx.put(Item::new(key.clone(), "new"))?;

    // Nothing delivered yet: purge must keep both versions.
    scheduler.purge(&fx.ctx)?;
    let mut tx = fx.conn.read_only(&fx.ctx);
    let batch = tx.get_events(start, 1_000_000)?;
    tx.commit()?;
    let values: Vec<_> = batch
        .events
        .iter()
        .filter(|e| e.item.key == key)
        .map(|e| (e.item.id, e.item.value.clone()))
        .collect();
    ensure(
        values.first() == Some(&(old.id, b"old".to_vec())),
        "undelivered event keeps its item",
    )?;
    ensure(values.len() == 2, "undelivered events kept")?;

    scheduler.poll(&fx.ctx)?;
    ensure(
        scheduler.watermark().get() >= batch.last_event_id,
        "watermark advanced past delivered events",
    )?;
    let delivered: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| e.item.key == key)
        .map(|e| e.item.value)
        .collect();
    ensure(
        delivered == vec![b"old".to_vec(), b"new".to_vec()],
        "sink saw both versions in order",
    )?;

    scheduler.purge(&fx.ctx)?;
    ensure(
        fx.get(&key)?.map(|i| i.value) == Some(b"new".to_vec()),
        "live item survives purge",
    )
}
