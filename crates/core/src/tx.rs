//! Transaction state machine shared by every engine adapter
//!
//! State transitions:
//! - `Active` → `Committed` (commit succeeded)
//! - `Active` → `Failed` (commit failed, an operation failed, rollback,
//!   context done, or a write on a read-only transaction)
//! - `Failed` → `Failed` (rollback replaces the latched error)
//!
//! Adapters hold a [`TxState`] next to their engine session and route every
//! data-plane call through [`TxState::run`]. The session only needs to know
//! how to commit and roll back, via [`NativeTx`].

use crate::context::Context;
use crate::error::{BackendError, Result};
use tracing::debug;

/// Engine session that can end a transaction
///
/// Both methods must be safe to call when no transaction is open (for
/// example, a second rollback) and do nothing in that case.
pub trait NativeTx {
    /// Commit the open transaction
    fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction
    fn rollback(&mut self) -> Result<()>;
}

/// Lifecycle status of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Accepting operations
    Active,
    /// Committed successfully
    Committed,
    /// Rolled back with a latched error
    Failed,
}

/// Whether an operation mutates the database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Reads only
    Read,
    /// Writes; rejected by read-only transactions
    Write,
}

/// State and latched error of one transaction
#[derive(Debug)]
pub struct TxState {
    status: TxStatus,
    err: Option<BackendError>,
    read_only: bool,
}

impl TxState {
    /// An Active transaction
    pub fn active(read_only: bool) -> Self {
        Self {
            status: TxStatus::Active,
            err: None,
            read_only,
        }
    }

    /// A transaction that failed before it started
    pub fn failed(err: BackendError, read_only: bool) -> Self {
        Self {
            status: TxStatus::Failed,
            err: Some(err),
            read_only,
        }
    }

    /// Current status
    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// Latched error
    pub fn err(&self) -> Option<&BackendError> {
        self.err.as_ref()
    }

    /// True for transactions begun with `read_only`
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Run one data-plane operation.
    ///
    /// Returns the latched error without calling `f` when Failed. Otherwise
    /// checks the context and the read-only policy, then calls `f`; any error
    /// rolls the session back and is latched.
    pub fn run<N, T, F>(
        &mut self,
        native: &mut N,
        ctx: &Context,
        op: &'static str,
        access: Access,
        f: F,
    ) -> Result<T>
    where
        N: NativeTx,
        F: FnOnce(&mut N) -> Result<T>,
    {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        debug_assert_eq!(self.status, TxStatus::Active, "{op} after commit");
        if let Err(err) = ctx.check() {
            return Err(self.fail(native, err));
        }
        if access == Access::Write && self.read_only {
            return Err(self.fail(native, BackendError::ReadOnly(op)));
        }
        match f(native) {
            Ok(v) => Ok(v),
            Err(err) => Err(self.fail(native, err)),
        }
    }

    /// Commit the session unless the transaction already failed
    pub fn commit<N: NativeTx>(&mut self, native: &mut N, ctx: &Context) -> Result<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.status == TxStatus::Committed {
            return Ok(());
        }
        if let Err(err) = ctx.check() {
            return Err(self.fail(native, err));
        }
        match native.commit() {
            Ok(()) => {
                self.status = TxStatus::Committed;
                Ok(())
            }
            Err(err) => Err(self.fail(native, err)),
        }
    }

    /// Roll back and latch `err`, replacing any earlier error
    pub fn rollback<N: NativeTx>(&mut self, native: &mut N, err: BackendError) -> BackendError {
        debug_assert_ne!(self.status, TxStatus::Committed, "rollback after commit");
        if let Err(rollback_err) = native.rollback() {
            debug!(error = %rollback_err, "rollback failed");
        }
        self.status = TxStatus::Failed;
        self.err = Some(err.clone());
        err
    }

    fn fail<N: NativeTx>(&mut self, native: &mut N, err: BackendError) -> BackendError {
        debug!(error = %err, "transaction failed, rolling back");
        self.rollback(native, err)
    }
}
