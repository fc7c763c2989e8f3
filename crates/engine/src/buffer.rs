//! Notification buffer
//!
//! The background worker hands every committed batch of events to an
//! [`EventSink`]. [`EventBuffer`] is the in-process sink: it retains the most
//! recent `capacity` events and fans them out to any number of [`Watcher`]s.
//! A watcher that falls behind the retained window gets
//! [`WatchError::Lagged`] once and then resumes at the oldest retained event.

use parking_lot::{Condvar, Mutex};
use relkv_core::Event;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Consumer of the ordered event stream
pub trait EventSink: Send + Sync + 'static {
    /// Called once, after the starting watermark is known and before the
    /// first batch
    fn set_init(&self);

    /// Deliver a batch in ascending EventID order
    fn emit(&self, events: Vec<Event>);
}

/// Why a watcher could not receive the next event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WatchError {
    /// Events were evicted before this watcher read them
    #[error("watcher lagged behind by {missed} events")]
    Lagged {
        /// Number of events skipped
        missed: u64,
    },

    /// The buffer was closed and every retained event has been read
    #[error("event buffer closed")]
    Closed,
}

struct BufferState {
    events: VecDeque<Event>,
    /// Absolute position of `events[0]`
    start: u64,
    init: bool,
    closed: bool,
}

impl BufferState {
    fn end(&self) -> u64 {
        self.start + self.events.len() as u64
    }
}

struct BufferInner {
    state: Mutex<BufferState>,
    changed: Condvar,
    capacity: usize,
}

/// Bounded in-memory fan-out buffer
#[derive(Clone)]
pub struct EventBuffer {
    inner: Arc<BufferInner>,
}

impl std::fmt::Debug for EventBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("EventBuffer")
            .field("capacity", &self.inner.capacity)
            .field("len", &state.events.len())
            .field("init", &state.init)
            .field("closed", &state.closed)
            .finish()
    }
}

impl EventBuffer {
    /// Create a buffer retaining at most `capacity` events (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(BufferInner {
                state: Mutex::new(BufferState {
                    events: VecDeque::with_capacity(capacity),
                    start: 0,
                    init: false,
                    closed: false,
                }),
                changed: Condvar::new(),
                capacity,
            }),
        }
    }

    /// Maximum number of retained events
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of retained events
    pub fn len(&self) -> usize {
        self.inner.state.lock().events.len()
    }

    /// True when no events are retained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the producer signalled readiness
    pub fn is_init(&self) -> bool {
        self.inner.state.lock().init
    }

    /// Block until the producer signals readiness or `timeout` elapses
    pub fn wait_init(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.init && !state.closed {
            if self.inner.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.init
    }

    /// A watcher that receives events emitted from now on
    pub fn watch(&self) -> Watcher {
        let cursor = self.inner.state.lock().end();
        Watcher {
            inner: Arc::clone(&self.inner),
            cursor,
        }
    }

    /// Stop accepting events and wake every watcher
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        self.inner.changed.notify_all();
    }
}

impl EventSink for EventBuffer {
    fn set_init(&self) {
        let mut state = self.inner.state.lock();
        state.init = true;
        self.inner.changed.notify_all();
    }

    fn emit(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        for event in events {
            if state.events.len() == self.inner.capacity {
                state.events.pop_front();
                state.start += 1;
            }
            state.events.push_back(event);
        }
        self.inner.changed.notify_all();
    }
}

/// Ordered reader over an [`EventBuffer`]
pub struct Watcher {
    inner: Arc<BufferInner>,
    cursor: u64,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("cursor", &self.cursor)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    fn take(&mut self, state: &BufferState) -> Option<Result<Event, WatchError>> {
        if self.cursor < state.start {
            let missed = state.start - self.cursor;
            self.cursor = state.start;
            return Some(Err(WatchError::Lagged { missed }));
        }
        if self.cursor < state.end() {
            let idx = (self.cursor - state.start) as usize;
            self.cursor += 1;
            return state.events.get(idx).cloned().map(Ok);
        }
        if state.closed {
            return Some(Err(WatchError::Closed));
        }
        None
    }

    /// Next event if one is available, without blocking
    pub fn try_recv(&mut self) -> Result<Option<Event>, WatchError> {
        let inner = Arc::clone(&self.inner);
        let state = inner.state.lock();
        self.take(&state).transpose()
    }

    /// Next event, waiting up to `timeout`. `Ok(None)` means the wait timed out.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Event>, WatchError> {
        let deadline = Instant::now() + timeout;
        let inner = Arc::clone(&self.inner);
        let mut state = inner.state.lock();
        loop {
            if let Some(next) = self.take(&state) {
                return next.map(Some);
            }
            if inner.changed.wait_until(&mut state, deadline).timed_out() {
                return self.take(&state).transpose();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relkv_core::{Item, OpType};

    fn event(id: i64) -> Event {
        Event {
            event_id: id,
            op: OpType::Put,
            item: Item::new(format!("k{id}"), "v"),
        }
    }

    #[test]
    fn test_watcher_receives_in_order() {
        let buffer = EventBuffer::new(8);
        let mut watcher = buffer.watch();
        buffer.emit(vec![event(1), event(2)]);
        buffer.emit(vec![event(3)]);

        let ids: Vec<_> = (0..3)
            .map(|_| watcher.try_recv().unwrap().unwrap().event_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(watcher.try_recv().unwrap(), None);
    }

    #[test]
    fn test_watcher_starts_at_tail() {
        let buffer = EventBuffer::new(8);
        buffer.emit(vec![event(1)]);
        let mut watcher = buffer.watch();
        assert_eq!(watcher.try_recv().unwrap(), None);
        buffer.emit(vec![event(2)]);
        assert_eq!(watcher.try_recv().unwrap().unwrap().event_id, 2);
    }

    #[test]
    fn test_lagged_watcher_resumes_at_oldest() {
        let buffer = EventBuffer::new(2);
        let mut watcher = buffer.watch();
        buffer.emit(vec![event(1), event(2), event(3), event(4)]);

        assert_eq!(
            watcher.try_recv().unwrap_err(),
            WatchError::Lagged { missed: 2 }
        );
        assert_eq!(watcher.try_recv().unwrap().unwrap().event_id, 3);
        assert_eq!(watcher.try_recv().unwrap().unwrap().event_id, 4);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_close_drains_then_reports_closed() {
        let buffer = EventBuffer::new(4);
        let mut watcher = buffer.watch();
        buffer.emit(vec![event(1)]);
        buffer.close();
        buffer.emit(vec![event(2)]);

        assert_eq!(watcher.try_recv().unwrap().unwrap().event_id, 1);
        assert_eq!(watcher.try_recv().unwrap_err(), WatchError::Closed);
    }

    #[test]
    fn test_recv_timeout_wakes_on_emit() {
        let buffer = EventBuffer::new(4);
        let mut watcher = buffer.watch();
        let producer = buffer.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.emit(vec![event(7)]);
        });
        let got = watcher.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got.unwrap().event_id, 7);
        handle.join().unwrap();
    }

    #[test]
    fn test_recv_timeout_expires() {
        let buffer = EventBuffer::new(4);
        let mut watcher = buffer.watch();
        assert_eq!(watcher.recv_timeout(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn test_wait_init() {
        let buffer = EventBuffer::new(4);
        assert!(!buffer.wait_init(Duration::from_millis(5)));
        buffer.set_init();
        assert!(buffer.is_init());
        assert!(buffer.wait_init(Duration::ZERO));
    }
}
