//! Structured cancellation for build runs.
//!
//! A single [`CancellationToken`] is created by the caller per run and passed
//! to every step. Waiters and retry loops select on it so a cancel interrupts
//! the current sleep instead of waiting out the remaining attempts.

mod token;

pub use token::{CancelCallback, CancellationToken, Cancelled};
