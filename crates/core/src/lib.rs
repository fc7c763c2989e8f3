//! Core types and traits for relkv
//!
//! This crate defines everything the engine adapters and the backend share:
//! - Item, Lease, Event, OpType: the data model
//! - Timestamp: microsecond expiry instants
//! - BackendError / ErrorKind: the four-class error taxonomy
//! - Clock: time source for lease expiry
//! - Context: cancellation and deadlines
//! - Config: validated backend configuration
//! - Driver, Connection, Transaction: the engine contracts
//! - TxState: the transaction state machine adapters build on
//! - new_id: item ID generation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod id;
pub mod timestamp;
pub mod traits;
pub mod tx;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigParams, PoolConfig};
pub use context::Context;
pub use error::{BackendError, ErrorKind, Result};
pub use id::new_id;
pub use timestamp::Timestamp;
pub use traits::{Connection, Driver, Transaction};
pub use tx::{Access, NativeTx, TxState, TxStatus};
pub use types::{Event, EventBatch, Item, Lease, OpType};
