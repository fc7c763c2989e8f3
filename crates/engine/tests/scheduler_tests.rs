//! Background scheduler tests
//!
//! Cycles are driven by hand so every step is deterministic. Time is a
//! ManualClock; physical rows are checked straight from the SQLite file.

mod common;

use common::{fast_config, init_tracing, TestDb};
use relkv_core::{Clock, Connection, Context, Driver, Item, OpType, Transaction};
use relkv_engine::{EventBuffer, EventSink, Scheduler};
use relkv_sqlite::SqliteDb;
use std::sync::Arc;
use std::time::Duration;

fn put(db: &SqliteDb, item: Item) -> Item {
    let ctx = Context::background();
    let mut tx = db.begin(&ctx);
    let mut item = item;
    item.id = tx.insert_item(&item).unwrap();
    tx.upsert_lease(&item).unwrap();
    tx.insert_event(OpType::Put, &item).unwrap();
    tx.commit().unwrap();
    item
}

fn get(db: &SqliteDb, key: &[u8]) -> Option<Item> {
    let ctx = Context::background();
    let mut tx = db.read_only(&ctx);
    let item = tx.get_item(key).unwrap();
    tx.commit().unwrap();
    item
}

#[test]
fn test_ttl_expiry_scenario() {
    init_tracing();
    let test_db = TestDb::new();
    let driver = test_db.driver(fast_config());
    let ctx = Context::background();
    let db = Arc::new(driver.open(&ctx).unwrap());
    let buffer = EventBuffer::new(16);
    let scheduler =
        Scheduler::start(Arc::clone(&db), Arc::new(buffer.clone()), driver.config(), &ctx).unwrap();
    assert!(buffer.is_init());
    let mut watcher = buffer.watch();

    let expires = test_db.clock.now().saturating_add(Duration::from_secs(2));
    let stored = put(&db, Item::new("a", "1").with_expires(expires));
    test_db.clock.advance(Duration::from_secs(3));

    // Lazy expiry: absent before any cycle ran.
    assert_eq!(get(&db, b"a"), None);
    assert_eq!(test_db.rows("lease", b"a"), 1);

    assert_eq!(scheduler.poll(&ctx).unwrap(), 2);
    let put_event = watcher.try_recv().unwrap().unwrap();
    let delete_event = watcher.try_recv().unwrap().unwrap();
    assert_eq!(put_event.op, OpType::Put);
    assert_eq!(delete_event.op, OpType::Delete);
    assert_eq!(delete_event.item.key, b"a".to_vec());
    assert_eq!(delete_event.item.id, stored.id);
    assert_eq!(delete_event.item.value, b"1".to_vec());
    assert_eq!(delete_event.item.expires, Some(expires));
    assert_eq!(scheduler.watermark().get(), delete_event.event_id);

    // The expired lease went away with its event; nothing is reported twice.
    assert_eq!(test_db.rows("lease", b"a"), 0);
    assert_eq!(scheduler.poll(&ctx).unwrap(), 0);
    assert_eq!(watcher.try_recv().unwrap(), None);

    let stats = scheduler.purge(&ctx).unwrap();
    assert_eq!(stats.events, 2);
    assert_eq!(stats.items, 1);
    assert_eq!(test_db.rows("item", b"a"), 0);
    assert_eq!(test_db.rows("event", b"a"), 0);
}

#[test]
fn test_purge_before_poll_keeps_undelivered_rows() {
    let test_db = TestDb::new();
    let driver = test_db.driver(fast_config());
    let ctx = Context::background();
    let db = Arc::new(driver.open(&ctx).unwrap());
    let buffer = EventBuffer::new(16);
    let scheduler =
        Scheduler::start(Arc::clone(&db), Arc::new(buffer.clone()), driver.config(), &ctx).unwrap();
    let mut watcher = buffer.watch();

    let expires = test_db.clock.now().saturating_add(Duration::from_secs(1));
    put(&db, Item::new("a", "1").with_expires(expires));
    test_db.clock.advance(Duration::from_secs(1));

    // Purge runs first: it expires the lease but cannot drop anything the
    // sink has not seen.
    let stats = scheduler.purge(&ctx).unwrap();
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.events, 0);
    assert_eq!(stats.items, 0);
    assert_eq!(test_db.rows("item", b"a"), 1);
    assert_eq!(test_db.rows("event", b"a"), 2);

    assert_eq!(scheduler.poll(&ctx).unwrap(), 2);
    let ops: Vec<_> = (0..2)
        .map(|_| watcher.try_recv().unwrap().unwrap())
        .map(|e| (e.op, e.item.value))
        .collect();
    assert_eq!(
        ops,
        vec![(OpType::Put, b"1".to_vec()), (OpType::Delete, b"1".to_vec())]
    );
}

#[test]
fn test_watermark_starts_at_existing_log() {
    let test_db = TestDb::new();
    let driver = test_db.driver(fast_config());
    let ctx = Context::background();
    let db = Arc::new(driver.open(&ctx).unwrap());
    put(&db, Item::new("before", "1"));

    let buffer = EventBuffer::new(16);
    let scheduler =
        Scheduler::start(Arc::clone(&db), Arc::new(buffer.clone()), driver.config(), &ctx).unwrap();
    let mut watcher = buffer.watch();
    assert_eq!(scheduler.watermark().get(), 1);

    put(&db, Item::new("after", "2"));
    assert_eq!(scheduler.poll(&ctx).unwrap(), 1);
    let event = watcher.try_recv().unwrap().unwrap();
    assert_eq!(event.item.key, b"after".to_vec());
    assert_eq!(watcher.try_recv().unwrap(), None);
}

#[test]
fn test_poll_batches_at_half_buffer() {
    let test_db = TestDb::new();
    let mut cfg = fast_config();
    cfg.buffer_size = 4;
    let driver = test_db.driver(cfg);
    let ctx = Context::background();
    let db = Arc::new(driver.open(&ctx).unwrap());
    let buffer = EventBuffer::new(64);
    let scheduler =
        Scheduler::start(Arc::clone(&db), Arc::new(buffer.clone()), driver.config(), &ctx).unwrap();

    for i in 0..5 {
        put(&db, Item::new(format!("k{i}"), "v"));
    }
    assert_eq!(scheduler.poll(&ctx).unwrap(), 2);
    assert_eq!(scheduler.poll(&ctx).unwrap(), 2);
    assert_eq!(scheduler.poll(&ctx).unwrap(), 1);
    assert_eq!(scheduler.poll(&ctx).unwrap(), 0);
    assert_eq!(buffer.len(), 5);
    assert_eq!(scheduler.watermark().get(), 5);
}

#[test]
fn test_failed_poll_keeps_watermark() {
    let test_db = TestDb::new();
    let driver = test_db.driver(fast_config());
    let ctx = Context::background();
    let db = Arc::new(driver.open(&ctx).unwrap());
    let buffer = EventBuffer::new(16);
    let scheduler =
        Scheduler::start(Arc::clone(&db), Arc::new(buffer.clone()), driver.config(), &ctx).unwrap();
    put(&db, Item::new("a", "1"));

    let canceled = Context::background();
    canceled.cancel();
    assert!(scheduler.poll(&canceled).unwrap_err().is_cancellation());
    assert_eq!(scheduler.watermark().get(), 0);
    assert!(buffer.is_empty());

    assert_eq!(scheduler.poll(&ctx).unwrap(), 1);
    assert_eq!(scheduler.watermark().get(), 1);
}

#[test]
fn test_worker_delivers_and_stops() {
    init_tracing();
    let test_db = TestDb::new();
    let driver = test_db.driver(fast_config());
    let ctx = Context::background();
    let db = Arc::new(driver.open(&ctx).unwrap());
    let buffer = EventBuffer::new(16);
    let mut watcher = buffer.watch();
    let scheduler =
        Scheduler::start(Arc::clone(&db), Arc::new(buffer.clone()), driver.config(), &ctx).unwrap();
    let watermark = scheduler.watermark();
    let close = Context::background();
    let worker = scheduler.spawn(close.clone()).unwrap();

    put(&db, Item::new("a", "1"));
    let event = watcher
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .expect("worker delivered the event");
    assert_eq!(event.item.key, b"a".to_vec());
    assert_eq!(watermark.get(), event.event_id);

    close.cancel();
    worker.join().unwrap();
}

struct PanicOnEmit;

impl EventSink for PanicOnEmit {
    fn set_init(&self) {}

    fn emit(&self, _events: Vec<relkv_core::Event>) {
        panic!("no events expected");
    }
}

#[test]
fn test_empty_poll_emits_nothing() {
    let test_db = TestDb::new();
    let driver = test_db.driver(fast_config());
    let ctx = Context::background();
    let db = Arc::new(driver.open(&ctx).unwrap());
    let scheduler =
        Scheduler::start(Arc::clone(&db), Arc::new(PanicOnEmit), driver.config(), &ctx).unwrap();
    assert_eq!(scheduler.poll(&ctx).unwrap(), 0);
    let stats = scheduler.purge(&ctx).unwrap();
    assert_eq!(stats, Default::default());
}
