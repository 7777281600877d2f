//! Waiter parameters and the generic poll loop.
//!
//! [`PollingConfig::resolve`] turns explicit config and the recognised
//! environment variables into [`ResolvedPolling`]. Each waiter then fills the
//! remaining gaps with its own [`WaiterDefaults`] and runs [`wait_until`].

use crate::cancellation::CancellationToken;
use crate::errors::CloudError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Overrides the waiter attempt count.
pub const ENV_MAX_ATTEMPTS: &str = "AWS_MAX_ATTEMPTS";
/// Overrides the waiter delay in seconds.
pub const ENV_POLL_DELAY_SECONDS: &str = "AWS_POLL_DELAY_SECONDS";
/// Legacy total timeout, converted to an attempt count.
pub const ENV_TIMEOUT_SECONDS: &str = "AWS_TIMEOUT_SECONDS";

const LEGACY_DEFAULT_DELAY: Duration = Duration::from_secs(2);

/// Source of environment variables.
pub trait EnvSource {
    /// Returns the value of `key`, if set.
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// User-facing polling overrides (`aws_polling { max_attempts, delay_seconds }`).
///
/// Zero means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Maximum number of state checks.
    pub max_attempts: u32,
    /// Seconds between state checks.
    pub delay_seconds: u64,
}

/// Which precedence level decided the polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollingSource {
    /// Explicit non-zero configuration values.
    Explicit,
    /// `AWS_MAX_ATTEMPTS` / `AWS_POLL_DELAY_SECONDS`.
    Environment,
    /// Derived from `AWS_TIMEOUT_SECONDS`.
    LegacyTimeout,
    /// Nothing set; each waiter uses its own defaults.
    WaiterDefault,
}

/// Polling parameters after precedence has been applied.
///
/// `None` means the waiter-specific default applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPolling {
    /// Resolved attempt count.
    pub max_attempts: Option<u32>,
    /// Resolved delay between attempts.
    pub delay: Option<Duration>,
    /// The highest-precedence level that contributed a value.
    pub source: PollingSource,
}

impl Default for ResolvedPolling {
    fn default() -> Self {
        Self {
            max_attempts: None,
            delay: None,
            source: PollingSource::WaiterDefault,
        }
    }
}

/// Hardcoded parameters of one waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterDefaults {
    /// Attempts when nothing overrides them.
    pub max_attempts: u32,
    /// Delay when nothing overrides it.
    pub delay: Duration,
}

impl WaiterDefaults {
    /// Default for image, instance, snapshot and volume waiters.
    pub const STANDARD: Self = Self {
        max_attempts: 40,
        delay: Duration::from_secs(15),
    };

    /// Image import tasks run for a long time.
    pub const IMAGE_IMPORT: Self = Self {
        max_attempts: 720,
        delay: Duration::from_secs(5),
    };

    /// Spot requests are usually fulfilled quickly.
    pub const SPOT_REQUEST: Self = Self {
        max_attempts: 40,
        delay: Duration::from_secs(5),
    };
}

/// Concrete parameters handed to [`wait_until`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    /// Total state checks before timing out.
    pub max_attempts: u32,
    /// Sleep between state checks.
    pub delay: Duration,
}

impl ResolvedPolling {
    /// Fills unset values from the waiter's defaults.
    #[must_use]
    pub fn for_waiter(&self, defaults: WaiterDefaults) -> WaitOptions {
        WaitOptions {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            delay: self.delay.unwrap_or(defaults.delay),
        }
    }
}

fn env_number(env: &dyn EnvSource, key: &str) -> Option<u64> {
    let raw = env.var(key)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<u64>() {
        Ok(0) => None,
        Ok(n) => Some(n),
        Err(_) => {
            warn!(variable = key, value = %trimmed, "Ignoring non-numeric polling override");
            None
        }
    }
}

impl PollingConfig {
    /// Creates an explicit polling config.
    #[must_use]
    pub const fn new(max_attempts: u32, delay_seconds: u64) -> Self {
        Self {
            max_attempts,
            delay_seconds,
        }
    }

    /// Applies precedence and emits one diagnostic describing the outcome.
    ///
    /// Precedence, highest first: explicit non-zero values,
    /// `AWS_MAX_ATTEMPTS`/`AWS_POLL_DELAY_SECONDS`, `AWS_TIMEOUT_SECONDS`
    /// (with a 2 second delay if none was given), waiter defaults.
    #[must_use]
    pub fn resolve(&self, env: &dyn EnvSource) -> ResolvedPolling {
        let timeout = env_number(env, ENV_TIMEOUT_SECONDS);

        let (delay, delay_source) = if self.delay_seconds > 0 {
            (
                Some(Duration::from_secs(self.delay_seconds)),
                Some(PollingSource::Explicit),
            )
        } else if let Some(secs) = env_number(env, ENV_POLL_DELAY_SECONDS) {
            (Some(Duration::from_secs(secs)), Some(PollingSource::Environment))
        } else if timeout.is_some() {
            (Some(LEGACY_DEFAULT_DELAY), Some(PollingSource::LegacyTimeout))
        } else {
            (None, None)
        };

        let (max_attempts, attempts_source) = if self.max_attempts > 0 {
            (Some(self.max_attempts), Some(PollingSource::Explicit))
        } else if let Some(n) = env_number(env, ENV_MAX_ATTEMPTS) {
            (
                Some(u32::try_from(n).unwrap_or(u32::MAX)),
                Some(PollingSource::Environment),
            )
        } else if let Some(total) = timeout {
            let step = delay.unwrap_or(LEGACY_DEFAULT_DELAY).as_secs().max(1);
            let attempts = u32::try_from((total / step).max(1)).unwrap_or(u32::MAX);
            (Some(attempts), Some(PollingSource::LegacyTimeout))
        } else {
            (None, None)
        };

        let source = [attempts_source, delay_source]
            .into_iter()
            .flatten()
            .min_by_key(|s| *s as u8)
            .unwrap_or(PollingSource::WaiterDefault);

        let resolved = ResolvedPolling {
            max_attempts,
            delay,
            source,
        };
        resolved.log_diagnostic(timeout.is_some());
        resolved
    }
}

impl ResolvedPolling {
    fn log_diagnostic(&self, timeout_set: bool) {
        match self.source {
            PollingSource::WaiterDefault => info!(
                "No polling overrides set; waiters use their own delays and attempt counts. \
                 Set {ENV_POLL_DELAY_SECONDS}/{ENV_MAX_ATTEMPTS} or aws_polling to customize"
            ),
            PollingSource::LegacyTimeout => warn!(
                max_attempts = ?self.max_attempts,
                delay_secs = ?self.delay.map(|d| d.as_secs()),
                "{ENV_TIMEOUT_SECONDS} is deprecated in favor of {ENV_MAX_ATTEMPTS}; \
                 polling delay defaults to 2 seconds unless set"
            ),
            PollingSource::Explicit | PollingSource::Environment if timeout_set => warn!(
                max_attempts = ?self.max_attempts,
                delay_secs = ?self.delay.map(|d| d.as_secs()),
                "Both an attempt count and {ENV_TIMEOUT_SECONDS} are set; ignoring the timeout"
            ),
            PollingSource::Explicit | PollingSource::Environment => info!(
                source = ?self.source,
                max_attempts = ?self.max_attempts,
                delay_secs = ?self.delay.map(|d| d.as_secs()),
                "Using polling overrides"
            ),
        }
    }
}

/// Error returned by [`wait_until`].
#[derive(Debug, Clone, Error)]
pub enum WaitError {
    /// The token fired while waiting.
    #[error("wait cancelled: {0}")]
    Cancelled(String),

    /// The resource never reached the target state.
    #[error("timed out waiting for {resource} after {attempts} attempt(s); last state: {last_state}")]
    Timeout {
        /// What was being waited on (e.g. `image ami-123`).
        resource: String,
        /// Number of state checks made.
        attempts: u32,
        /// The last observed state.
        last_state: String,
    },

    /// The remote job reported a terminal failure.
    #[error("{resource} failed: {status_message}")]
    Failed {
        /// What was being waited on.
        resource: String,
        /// The status message reported by the service.
        status_message: String,
    },

    /// Describing the resource failed.
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// One observation made by a waiter check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState<T> {
    /// Target state reached.
    Ready(T),
    /// Still transitioning; carries the observed state name.
    Pending(String),
    /// Terminal failure; carries the status message.
    Failed(String),
}

/// Polls `describe` until it reports a terminal state.
///
/// The delay sleep is cancel-aware, so cancellation is observed within one
/// delay interval rather than after the remaining attempts.
///
/// # Errors
///
/// Returns [`WaitError`] on cancellation, timeout, reported failure, or a
/// failed describe call.
pub async fn wait_until<T, F, Fut>(
    cancel: &CancellationToken,
    resource: &str,
    options: WaitOptions,
    mut describe: F,
) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollState<T>, CloudError>>,
{
    let mut last_state = String::from("unknown");

    for attempt in 1..=options.max_attempts {
        cancel
            .check()
            .map_err(|c| WaitError::Cancelled(c.reason))?;

        match describe().await? {
            PollState::Ready(value) => {
                debug!(resource, attempt, "Wait finished");
                return Ok(value);
            }
            PollState::Failed(status_message) => {
                return Err(WaitError::Failed {
                    resource: resource.to_string(),
                    status_message,
                });
            }
            PollState::Pending(state) => {
                debug!(resource, attempt, state = %state, "Still waiting");
                last_state = state;
            }
        }

        if attempt < options.max_attempts {
            cancel
                .sleep(options.delay)
                .await
                .map_err(|c| WaitError::Cancelled(c.reason))?;
        }
    }

    Err(WaitError::Timeout {
        resource: resource.to_string(),
        attempts: options.max_attempts,
        last_state,
    })
}
