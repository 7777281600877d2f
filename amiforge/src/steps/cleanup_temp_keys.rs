//! Removes the temporary SSH key from the instance before it is imaged.

use super::{ui, Step};
use crate::cancellation::CancellationToken;
use crate::config::CommunicatorConfig;
use crate::context::keys::COMMUNICATOR;
use crate::context::StateBag;
use crate::core::StepAction;
use async_trait::async_trait;
use tracing::warn;

/// Strips the temporary key from `authorized_keys` so it does not end up in
/// the image. Only runs when a temporary key pair was used; failure is
/// reported and the build goes on.
#[derive(Debug, Default)]
pub struct CleanupTempKeys {
    communicator: CommunicatorConfig,
}

impl CleanupTempKeys {
    /// Creates the step.
    #[must_use]
    pub fn new(communicator: CommunicatorConfig) -> Self {
        Self { communicator }
    }
}

#[async_trait]
impl Step for CleanupTempKeys {
    fn name(&self) -> &str {
        "cleanup_temp_keys"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &StateBag) -> StepAction {
        if !self.communicator.needs_temporary_key_pair() {
            return StepAction::Continue;
        }
        let Some(communicator) = state.get_ok(COMMUNICATOR) else {
            return StepAction::Continue;
        };

        ui(state).say("Trying to remove ephemeral keys from authorized_keys files");
        if let Err(err) = communicator.cleanup_temp_keys().await {
            warn!(error = %err, "Failed to remove temporary keys");
            ui(state).error(&format!("Error cleaning up ephemeral keys; the image may contain them: {err}"));
        }
        StepAction::Continue
    }
}
