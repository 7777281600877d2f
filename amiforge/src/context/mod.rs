//! Per-run context shared between steps.
//!
//! This module provides:
//! - The typed [`StateBag`] every step reads from and publishes into
//! - The catalogue of well-known [`keys`]

mod bags;
pub mod keys;

pub use bags::{StateBag, StateKey};
