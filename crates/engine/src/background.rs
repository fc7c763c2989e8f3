//! Background expiry, event delivery and purge
//!
//! One worker thread per backend runs two periodic cycles from a single
//! sequential loop:
//!
//! - **poll**: turns expired leases into Delete events, then fetches events
//!   past the watermark and forwards them to the [`EventSink`]
//! - **purge**: drops events at or before the watermark and items that
//!   nothing references any more
//!
//! Both cycles run in their own read-write transaction bounded by the poll
//! period. A failing cycle is logged once per failure streak and retried on
//! the next tick; nothing a cycle does can stop the worker.

use crate::buffer::EventSink;
use relkv_core::{
    BackendError, Config, Connection, Context, Item, OpType, Result, Transaction,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest single sleep of the worker, bounding shutdown latency
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Rows removed by one purge cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    /// Expired leases turned into Delete events
    pub expired: usize,
    /// Events at or before the watermark
    pub events: u64,
    /// Items no longer referenced
    pub items: u64,
}

/// Shared view of the delivered-event watermark
#[derive(Debug, Clone, Default)]
pub struct Watermark(Arc<AtomicI64>);

impl Watermark {
    /// Highest EventID delivered to the sink
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    fn set(&self, event_id: i64) {
        self.0.store(event_id, Ordering::Release);
    }
}

/// Poll and purge cycles over one connection
pub struct Scheduler<C: Connection> {
    conn: Arc<C>,
    sink: Arc<dyn EventSink>,
    watermark: Watermark,
    batch_size: usize,
    poll_period: Duration,
    purge_period: Duration,
}

impl<C: Connection> std::fmt::Debug for Scheduler<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("watermark", &self.watermark.get())
            .field("batch_size", &self.batch_size)
            .field("poll_period", &self.poll_period)
            .field("purge_period", &self.purge_period)
            .finish_non_exhaustive()
    }
}

/// Expire every lease past its deadline, logging a Delete event for each.
///
/// Each lease is removed in the same transaction that logs its event, so an
/// expiry is reported exactly once.
fn expire_leases<T: Transaction>(tx: &mut T) -> Result<usize> {
    let expired = tx.get_expired_leases()?;
    for lease in &expired {
        let item = Item {
            key: lease.key.clone(),
            value: Vec::new(),
            id: lease.id,
            expires: lease.expires,
        };
        tx.insert_event(OpType::Delete, &item)?;
        tx.delete_lease(&lease.key)?;
    }
    Ok(expired.len())
}

impl<C: Connection> Scheduler<C> {
    /// Seed the watermark from the current end of the event log and signal
    /// the sink ready.
    ///
    /// Events that exist before this call are never emitted.
    pub fn start(
        conn: Arc<C>,
        sink: Arc<dyn EventSink>,
        cfg: &Config,
        ctx: &Context,
    ) -> Result<Self> {
        let mut tx = conn.read_only(ctx);
        let last_event_id = tx.get_last_event_id()?;
        tx.commit()?;

        let watermark = Watermark::default();
        watermark.set(last_event_id);
        sink.set_init();
        info!(last_event_id, "event watermark initialized");

        Ok(Self {
            conn,
            sink,
            watermark,
            batch_size: cfg.poll_batch_size(),
            poll_period: cfg.poll_stream_period,
            purge_period: cfg.purge_period,
        })
    }

    /// Shared handle to the watermark
    pub fn watermark(&self) -> Watermark {
        self.watermark.clone()
    }

    /// Run one poll cycle, returning the number of events delivered
    pub fn poll(&self, ctx: &Context) -> Result<usize> {
        let from = self.watermark.get();
        let mut tx = self.conn.begin(ctx);
        let expired = expire_leases(&mut tx)?;
        let batch = tx.get_events(from, self.batch_size)?;
        tx.commit()?;

        let delivered = batch.events.len();
        if delivered > 0 {
            self.sink.emit(batch.events);
            self.watermark.set(batch.last_event_id);
        }
        debug!(
            expired,
            delivered,
            watermark = batch.last_event_id,
            "poll cycle complete"
        );
        Ok(delivered)
    }

    /// Run one purge cycle
    pub fn purge(&self, ctx: &Context) -> Result<PurgeStats> {
        let watermark = self.watermark.get();
        let mut tx = self.conn.begin(ctx);
        let expired = expire_leases(&mut tx)?;
        let events = tx.delete_events(watermark)?;
        let items = tx.delete_items(watermark)?;
        tx.commit()?;

        let stats = PurgeStats {
            expired,
            events,
            items,
        };
        debug!(?stats, watermark, "purge cycle complete");
        Ok(stats)
    }

    /// Run the worker on a new thread until `close` is done
    pub fn spawn(self, close: Context) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("relkv-bg".to_string())
            .spawn(move || self.run(&close))
            .map_err(|e| BackendError::engine(format!("failed to spawn background worker: {e}")))
    }

    /// Run the worker loop on the current thread until `close` is done
    pub fn run(self, close: &Context) {
        info!(
            poll_period = ?self.poll_period,
            purge_period = ?self.purge_period,
            "background worker started"
        );
        let mut next_poll = Instant::now() + self.poll_period;
        let mut next_purge = Instant::now() + self.purge_period;
        let mut streak = FailureStreak::default();

        while !close.is_done() {
            let now = Instant::now();
            let wake = next_poll.min(next_purge);
            if wake > now {
                std::thread::sleep((wake - now).min(SHUTDOWN_CHECK_INTERVAL));
                continue;
            }

            if now >= next_poll {
                let ctx = close.with_timeout(self.poll_period);
                streak.record("poll", self.poll(&ctx).map(drop));
                next_poll = next_tick(next_poll, self.poll_period, Instant::now());
            }
            if now >= next_purge {
                let ctx = close.with_timeout(self.poll_period);
                streak.record("purge", self.purge(&ctx).map(drop));
                next_purge = next_tick(next_purge, self.purge_period, Instant::now());
            }
        }
        info!(watermark = self.watermark.get(), "background worker stopped");
    }
}

/// First tick after `now` on the schedule `last + k * period`.
/// Ticks missed while a cycle ran late are skipped.
fn next_tick(last: Instant, period: Duration, now: Instant) -> Instant {
    let mut next = last + period;
    if next <= now {
        let behind = now.duration_since(last).as_nanos() / period.as_nanos().max(1);
        next = last + period.saturating_mul(u32::try_from(behind + 1).unwrap_or(u32::MAX));
    }
    next
}

/// Logs the first failure of a streak and its end
#[derive(Debug, Default)]
struct FailureStreak {
    failing: bool,
}

impl FailureStreak {
    fn record(&mut self, cycle: &'static str, result: Result<()>) {
        match result {
            Ok(()) => {
                if self.failing {
                    info!(cycle, "background cycle recovered");
                    self.failing = false;
                }
            }
            Err(err) => {
                if !self.failing {
                    if err.is_cancellation() {
                        warn!(cycle, error = %err, "background cycle interrupted");
                    } else {
                        error!(cycle, error = %err, "background cycle failed");
                    }
                }
                self.failing = true;
            }
        }
    }
}
