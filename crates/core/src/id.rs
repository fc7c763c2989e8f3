//! Item ID generation
//!
//! Item IDs are nanoseconds since the Unix epoch read from the wall clock,
//! bumped so that no two calls in one process return the same value. They are
//! never taken from an injectable [`Clock`](crate::Clock): a frozen test clock
//! would hand the same ID to every key written in one tick.
//!
//! IDs are unique per process and roughly time-ordered. Writers in different
//! processes can still collide; the `(key, id)` primary key rejects that case
//! as `AlreadyExists`, and the caller retries with a fresh ID.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_ID: AtomicI64 = AtomicI64::new(0);

/// Return a new item ID
pub fn new_id() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0);

    let mut last = LAST_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(last.saturating_add(1));
        match LAST_ID.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}
