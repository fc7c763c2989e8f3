//! Backend engine for relkv
//!
//! This crate runs on top of any [`relkv_core::Driver`]:
//! - Backend: key/value operations, each in one retried transaction
//! - Scheduler: the background worker that expires leases, delivers events
//!   and purges rows the event log no longer needs
//! - EventBuffer: bounded in-memory fan-out of the event stream
//! - retry_tx: caller-side retry of Retryable transactions
//!
//! Enable the `testing` feature for the driver compliance suite.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod background;
pub mod buffer;
pub mod retry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::Backend;
pub use background::{PurgeStats, Scheduler, Watermark};
pub use buffer::{EventBuffer, EventSink, WatchError, Watcher};
pub use retry::retry_tx;
