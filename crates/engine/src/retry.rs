//! Caller-side retry of whole transactions
//!
//! Adapters never retry on their own. A transaction that fails as Retryable
//! must be re-run from scratch, with a fresh transaction and fresh item IDs,
//! which is what [`retry_tx`] does.

use relkv_core::{Context, Result};
use std::time::Duration;
use tracing::debug;

/// Run `attempt` until it returns anything but a Retryable error.
///
/// Sleeps `retry_delay` between attempts and stops with the context's error
/// once `ctx` is canceled or past its deadline.
pub fn retry_tx<T, F>(ctx: &Context, retry_delay: Duration, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempts: u32 = 0;
    loop {
        ctx.check()?;
        attempts += 1;
        match attempt() {
            Err(err) if err.is_retryable() => {
                debug!(attempts, error = %err, "transaction conflict, retrying");
                let delay = ctx
                    .remaining()
                    .map_or(retry_delay, |left| left.min(retry_delay));
                std::thread::sleep(delay);
            }
            result => return result,
        }
    }
}
