//! Cancellation and deadlines
//!
//! A [`Context`] is handed to every connection and transaction call. It is
//! cheap to clone, and children inherit their parent's cancellation and
//! deadline:
//!
//! ```
//! use relkv_core::Context;
//! use std::time::Duration;
//!
//! let root = Context::background();
//! let cycle = root.with_timeout(Duration::from_secs(1));
//! assert!(cycle.check().is_ok());
//!
//! root.cancel();
//! assert!(cycle.check().is_err());
//! ```

use crate::error::{BackendError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct ContextInner {
    canceled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<Context>,
}

/// Cancellation signal with an optional deadline
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// A root context that is never done unless canceled
    pub fn background() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                canceled: AtomicBool::new(false),
                deadline: None,
                parent: None,
            }),
        }
    }

    /// A child that can be canceled independently of `self`
    pub fn child(&self) -> Self {
        self.derive(None)
    }

    /// A child that is done after `timeout` elapses
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.derive(Instant::now().checked_add(timeout))
    }

    /// A child that is done at `deadline`
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        self.derive(Some(deadline))
    }

    fn derive(&self, deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                canceled: AtomicBool::new(false),
                deadline,
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel this context and every context derived from it
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::Release);
    }

    /// Earliest deadline along the parent chain
    pub fn deadline(&self) -> Option<Instant> {
        let own = self.inner.deadline;
        let parent = self.inner.parent.as_ref().and_then(|p| p.deadline());
        match (own, parent) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Time left before the deadline, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline()
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
            || self.inner.parent.as_ref().map_or(false, |p| p.is_canceled())
    }

    /// Why the context is done, if it is
    pub fn err(&self) -> Option<BackendError> {
        if self.is_canceled() {
            return Some(BackendError::Canceled);
        }
        match self.deadline() {
            Some(d) if Instant::now() >= d => Some(BackendError::DeadlineExceeded),
            _ => None,
        }
    }

    /// True once canceled or past the deadline
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// `Err` once the context is done
    pub fn check(&self) -> Result<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
