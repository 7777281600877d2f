//! Step execution and the machinery around remote calls.
//!
//! This module provides:
//! - The sequential [`StepRunner`] with reverse-order cleanup
//! - Bounded retries with exponential backoff ([`RetryConfig`])
//! - Polling overrides and the cancellable [`wait_until`] loop

mod polling;
mod retry;
mod runner;

pub use polling::{
    wait_until, EnvSource, PollState, PollingConfig, PollingSource, ProcessEnv, ResolvedPolling,
    WaitError, WaitOptions, WaiterDefaults, ENV_MAX_ATTEMPTS, ENV_POLL_DELAY_SECONDS,
    ENV_TIMEOUT_SECONDS,
};
pub use retry::{Backoff, RetryConfig, RetryError};
pub use runner::{RunReport, StepRunner};

#[cfg(test)]
mod integration_tests;
