//! Backend facade tests over SQLite with a live background worker

mod common;

use common::{fast_config, init_tracing, TestDb};
use relkv_core::{BackendError, Clock, Connection, Context, Item, OpType, Transaction};
use relkv_engine::{Backend, EventBuffer, Watcher};
use relkv_sqlite::{SqliteConfig, SqliteDriver};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Test Helpers
// ============================================================================

fn setup() -> (Backend<SqliteDriver>, EventBuffer, TestDb) {
    init_tracing();
    let test_db = TestDb::new();
    let buffer = EventBuffer::new(64);
    let backend = Backend::new(
        test_db.driver(fast_config()),
        Arc::new(buffer.clone()),
        &Context::background(),
    )
    .unwrap();
    (backend, buffer, test_db)
}

fn next_event(watcher: &mut Watcher) -> relkv_core::Event {
    watcher
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .expect("event delivered in time")
}

// ============================================================================
// Key/value operations
// ============================================================================

#[test]
fn test_put_get_delete() {
    let (backend, _buffer, _db) = setup();
    let ctx = Context::background();

    let stored = backend.put(&ctx, Item::new("a", "1")).unwrap();
    assert!(stored.id > 0);
    assert_eq!(backend.get(&ctx, b"a").unwrap(), stored);

    backend.delete(&ctx, b"a").unwrap();
    assert!(backend.get(&ctx, b"a").unwrap_err().is_not_found());
    assert!(backend.delete(&ctx, b"a").unwrap_err().is_not_found());
}

#[test]
fn test_create_and_update_preconditions() {
    let (backend, _buffer, _db) = setup();
    let ctx = Context::background();

    assert!(backend
        .update(&ctx, Item::new("a", "0"))
        .unwrap_err()
        .is_not_found());
    backend.create(&ctx, Item::new("a", "1")).unwrap();
    assert!(backend
        .create(&ctx, Item::new("a", "2"))
        .unwrap_err()
        .is_already_exists());

    let updated = backend.update(&ctx, Item::new("a", "3")).unwrap();
    assert_eq!(backend.get(&ctx, b"a").unwrap().value, b"3".to_vec());
    assert_eq!(backend.get(&ctx, b"a").unwrap().id, updated.id);
}

#[test]
fn test_create_after_expiry() {
    let (backend, _buffer, db) = setup();
    let ctx = Context::background();
    let expires = db.clock.now().saturating_add(Duration::from_secs(1));
    backend
        .create(&ctx, Item::new("a", "1").with_expires(expires))
        .unwrap();
    db.clock.advance(Duration::from_secs(1));
    backend.create(&ctx, Item::new("a", "2")).unwrap();
    assert_eq!(backend.get(&ctx, b"a").unwrap().value, b"2".to_vec());
}

#[test]
fn test_compare_and_swap() {
    let (backend, _buffer, _db) = setup();
    let ctx = Context::background();
    let original = backend.put(&ctx, Item::new("a", "1")).unwrap();

    let err = backend
        .compare_and_swap(&ctx, &Item::new("a", "wrong"), Item::new("a", "2"))
        .unwrap_err();
    assert!(matches!(err, BackendError::CompareFailed(_)));
    assert_eq!(backend.get(&ctx, b"a").unwrap(), original);

    let swapped = backend
        .compare_and_swap(&ctx, &original, Item::new("a", "2"))
        .unwrap();
    assert_eq!(backend.get(&ctx, b"a").unwrap(), swapped);

    assert!(backend
        .compare_and_swap(&ctx, &Item::new("b", "1"), Item::new("b", "2"))
        .unwrap_err()
        .is_not_found());
    assert!(matches!(
        backend.compare_and_swap(&ctx, &Item::new("a", "2"), Item::new("b", "3")),
        Err(BackendError::BadParameter(_))
    ));
}

#[test]
fn test_range_and_delete_range() {
    let (backend, _buffer, _db) = setup();
    let ctx = Context::background();
    for key in ["a", "b", "c", "d"] {
        backend.put(&ctx, Item::new(key, key)).unwrap();
    }

    let keys = |items: Vec<Item>| items.into_iter().map(|i| i.key).collect::<Vec<_>>();
    assert_eq!(
        keys(backend.get_range(&ctx, b"b", b"c", 0).unwrap()),
        vec![b"b".to_vec(), b"c".to_vec()]
    );
    assert_eq!(backend.get_range(&ctx, b"a", b"d", 3).unwrap().len(), 3);

    assert_eq!(backend.delete_range(&ctx, b"a", b"b").unwrap(), 2);
    assert_eq!(
        keys(backend.get_range(&ctx, b"a", b"z", 0).unwrap()),
        vec![b"c".to_vec(), b"d".to_vec()]
    );
}

#[test]
fn test_keep_alive() {
    let (backend, _buffer, db) = setup();
    let ctx = Context::background();
    let soon = db.clock.now().saturating_add(Duration::from_secs(1));
    let stored = backend
        .put(&ctx, Item::new("a", "1").with_expires(soon))
        .unwrap();

    let later = db.clock.now().saturating_add(Duration::from_secs(60));
    backend.keep_alive(&ctx, &stored.lease(), Some(later)).unwrap();
    db.clock.advance(Duration::from_secs(2));
    let current = backend.get(&ctx, b"a").unwrap();
    assert_eq!(current.expires, Some(later));
    assert_eq!(current.id, stored.id);

    let mut stale = stored.lease();
    stale.id += 1;
    assert!(backend
        .keep_alive(&ctx, &stale, None)
        .unwrap_err()
        .is_not_found());
}

// ============================================================================
// Event stream
// ============================================================================

#[test]
fn test_events_follow_commit_order() {
    let (backend, buffer, _db) = setup();
    let ctx = Context::background();
    let mut watcher = buffer.watch();

    backend.put(&ctx, Item::new("a", "1")).unwrap();
    backend.put(&ctx, Item::new("a", "2")).unwrap();
    backend.delete(&ctx, b"a").unwrap();

    let events: Vec<_> = (0..3).map(|_| next_event(&mut watcher)).collect();
    let ops: Vec<_> = events.iter().map(|e| (e.op, e.item.value.clone())).collect();
    assert_eq!(
        ops,
        vec![
            (OpType::Put, b"1".to_vec()),
            (OpType::Put, b"2".to_vec()),
            (OpType::Delete, b"2".to_vec()),
        ]
    );
    assert!(events.windows(2).all(|w| w[0].event_id < w[1].event_id));
}

#[test]
fn test_worker_reports_expiry() {
    let (backend, buffer, db) = setup();
    let ctx = Context::background();
    let mut watcher = buffer.watch();
    let expires = db.clock.now().saturating_add(Duration::from_secs(2));
    backend
        .put(&ctx, Item::new("a", "1").with_expires(expires))
        .unwrap();
    assert_eq!(next_event(&mut watcher).op, OpType::Put);

    db.clock.advance(Duration::from_secs(3));
    assert!(backend.get(&ctx, b"a").unwrap_err().is_not_found());
    let event = next_event(&mut watcher);
    assert_eq!(event.op, OpType::Delete);
    assert_eq!(event.item.key, b"a".to_vec());

    // Purge eventually reclaims the delivered rows.
    let deadline = Instant::now() + Duration::from_secs(5);
    while db.rows("item", b"a") > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(db.rows("item", b"a"), 0);
    assert_eq!(db.rows("lease", b"a"), 0);
}

// ============================================================================
// Conflicts and lifecycle
// ============================================================================

#[test]
fn test_conflicting_writer_is_retried() {
    init_tracing();
    let test_db = TestDb::new();
    let mut backend_cfg = fast_config();
    backend_cfg.retry_delay_period = Duration::from_millis(20);
    let driver = SqliteDriver::new(
        SqliteConfig::new(&test_db.path)
            .with_busy_timeout(Duration::ZERO)
            .with_backend(backend_cfg.with_clock(test_db.clock.clone())),
    );
    let buffer = EventBuffer::new(64);
    let backend = Backend::new(driver, Arc::new(buffer), &Context::background()).unwrap();
    let ctx = Context::background();

    // Hold the write lock so the backend's first attempt fails as Retryable.
    let mut holder = backend.connection().begin(&ctx);
    assert!(holder.err().is_none());
    let mut blocked = backend.connection().begin(&ctx);
    assert!(blocked.err().unwrap().is_retryable());
    assert!(blocked.commit().unwrap_err().is_retryable());

    std::thread::scope(|s| {
        let writer = s.spawn(|| backend.put(&ctx, Item::new("a", "1")));
        std::thread::sleep(Duration::from_millis(100));
        holder.commit().unwrap();
        let stored = writer.join().unwrap().unwrap();
        assert_eq!(stored.value, b"1".to_vec());
    });
    assert_eq!(backend.get(&ctx, b"a").unwrap().value, b"1".to_vec());
}

#[test]
fn test_deadline_stops_retries() {
    let test_db = TestDb::new();
    let driver = SqliteDriver::new(
        SqliteConfig::new(&test_db.path)
            .with_busy_timeout(Duration::ZERO)
            .with_backend(fast_config().with_clock(test_db.clock.clone())),
    );
    let backend =
        Backend::new(driver, Arc::new(EventBuffer::new(8)), &Context::background()).unwrap();

    let mut holder = backend.connection().begin(&Context::background());
    let ctx = Context::background().with_timeout(Duration::from_millis(100));
    let err = backend.put(&ctx, Item::new("a", "1")).unwrap_err();
    assert_eq!(err, BackendError::DeadlineExceeded);
    holder.commit().unwrap();
}

#[test]
fn test_close_is_idempotent() {
    let (backend, _buffer, _db) = setup();
    let ctx = Context::background();
    backend.put(&ctx, Item::new("a", "1")).unwrap();
    backend.close().unwrap();
    backend.close().unwrap();
    assert!(matches!(
        backend.get(&ctx, b"a"),
        Err(BackendError::Connection(_))
    ));
}

#[test]
fn test_restart_does_not_replay_events() {
    let test_db = TestDb::new();
    let ctx = Context::background();
    {
        let backend = Backend::new(
            test_db.driver(fast_config()),
            Arc::new(EventBuffer::new(8)),
            &ctx,
        )
        .unwrap();
        backend.put(&ctx, Item::new("a", "1")).unwrap();
        backend.close().unwrap();
    }

    let buffer = EventBuffer::new(8);
    let mut watcher = buffer.watch();
    let backend =
        Backend::new(test_db.driver(fast_config()), Arc::new(buffer.clone()), &ctx).unwrap();
    assert!(buffer.is_init());
    assert!(backend.watermark() >= 1);
    backend.put(&ctx, Item::new("b", "2")).unwrap();
    assert_eq!(next_event(&mut watcher).item.key, b"b".to_vec());
}

#[test]
fn test_open_failure_is_fatal() {
    let test_db = TestDb::new();
    std::fs::create_dir_all(&test_db.path).unwrap();
    let ctx = Context::background().with_timeout(Duration::from_secs(1));
    let err = Backend::new(
        test_db.driver(fast_config()),
        Arc::new(EventBuffer::new(8)),
        &ctx,
    )
    .unwrap_err();
    assert!(matches!(err, BackendError::Connection(_)));
}
