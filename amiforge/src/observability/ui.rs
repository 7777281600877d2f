//! The human-readable progress stream.

use super::SecretFilter;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{error, info, Level};

/// Receives progress messages meant for the operator.
///
/// Messages are informational only; nothing in the build parses them.
pub trait Ui: Send + Sync + Debug {
    /// A top-level progress line (`"Creating AMI..."`).
    fn say(&self, message: &str);

    /// A detail line under the current progress line.
    fn message(&self, message: &str);

    /// An error line.
    fn error(&self, message: &str);
}

/// A no-op UI that discards all messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpUi;

impl Ui for NoOpUi {
    fn say(&self, _message: &str) {}

    fn message(&self, _message: &str) {}

    fn error(&self, _message: &str) {}
}

/// A UI that forwards messages to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingUi {
    level: Level,
}

impl Default for LoggingUi {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingUi {
    /// Creates a logging UI emitting `say`/`message` at `level`.
    #[must_use]
    pub const fn new(level: Level) -> Self {
        Self { level }
    }

    fn emit(&self, kind: &str, message: &str) {
        if self.level == Level::DEBUG {
            tracing::debug!(ui = kind, "{message}");
        } else {
            info!(ui = kind, "{message}");
        }
    }
}

impl Ui for LoggingUi {
    fn say(&self, message: &str) {
        self.emit("say", message);
    }

    fn message(&self, message: &str) {
        self.emit("message", message);
    }

    fn error(&self, message: &str) {
        error!(ui = "error", "{message}");
    }
}

/// Wraps another UI and masks registered secrets in every message.
#[derive(Debug, Clone)]
pub struct RedactingUi {
    inner: Arc<dyn Ui>,
    filter: SecretFilter,
}

impl RedactingUi {
    /// Wraps `inner` with `filter`.
    #[must_use]
    pub fn new(inner: Arc<dyn Ui>, filter: SecretFilter) -> Self {
        Self { inner, filter }
    }

    /// Returns the filter applied to messages.
    #[must_use]
    pub const fn filter(&self) -> &SecretFilter {
        &self.filter
    }
}

impl Ui for RedactingUi {
    fn say(&self, message: &str) {
        self.inner.say(&self.filter.redact(message));
    }

    fn message(&self, message: &str) {
        self.inner.message(&self.filter.redact(message));
    }

    fn error(&self, message: &str) {
        self.inner.error(&self.filter.redact(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CollectingUi;

    #[test]
    fn test_redacting_ui_masks_secrets() {
        let collected = Arc::new(CollectingUi::new());
        let filter = SecretFilter::new();
        filter.register("AKIAEXAMPLE");

        let ui = RedactingUi::new(collected.clone(), filter);
        ui.say("using key AKIAEXAMPLE");
        ui.error("AKIAEXAMPLE rejected");

        assert_eq!(
            collected.lines(),
            vec![
                "say: using key <sensitive>".to_string(),
                "error: <sensitive> rejected".to_string(),
            ]
        );
    }

    #[test]
    fn test_noop_and_logging_do_not_panic() {
        NoOpUi.say("hello");
        LoggingUi::default().message("hello");
        LoggingUi::new(Level::DEBUG).error("boom");
    }
}
