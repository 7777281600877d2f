//! Key pair for the SSH communicator.

use super::{ec2, halt, try_step, ui, Step};
use crate::cancellation::CancellationToken;
use crate::config::{CommunicatorConfig, CommunicatorType};
use crate::context::keys::{KEY_PAIR, PRIVATE_KEY};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Publishes `key_pair` and `private_key`.
///
/// Uses the configured key pair and key file when given; otherwise creates a
/// temporary key pair that is deleted on cleanup.
#[derive(Debug, Default)]
pub struct KeyPairStep {
    communicator: CommunicatorConfig,
    created: Mutex<Option<String>>,
}

impl KeyPairStep {
    /// Creates the step.
    #[must_use]
    pub fn new(communicator: CommunicatorConfig) -> Self {
        Self {
            communicator,
            created: Mutex::new(None),
        }
    }

    async fn load_private_key(&self) -> Result<String, AmiforgeError> {
        let path = &self.communicator.private_key_file;
        tokio::fs::read_to_string(path).await.map_err(|err| {
            AmiforgeError::step(format!("error loading private key file {path}: {err}"))
        })
    }
}

#[async_trait]
impl Step for KeyPairStep {
    fn name(&self) -> &str {
        "key_pair"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &StateBag) -> StepAction {
        if self.communicator.kind != CommunicatorType::Ssh {
            return StepAction::Continue;
        }

        if !self.communicator.private_key_file.is_empty() {
            ui(state).say("Using existing SSH private key");
            let key = try_step!(state, self.load_private_key().await);
            state.put(PRIVATE_KEY, key);
            if !self.communicator.keypair_name.is_empty() {
                state.put(KEY_PAIR, self.communicator.keypair_name.clone());
            }
            return StepAction::Continue;
        }

        let name = if self.communicator.temporary_key_pair_name.is_empty() {
            format!("packer_{}", Uuid::new_v4())
        } else {
            self.communicator.temporary_key_pair_name.clone()
        };

        ui(state).say(&format!("Creating temporary keypair: {name}"));
        let ec2 = try_step!(state, ec2(state));
        let key_pair = match ec2.create_key_pair(&name).await {
            Ok(key_pair) => key_pair,
            Err(err) => {
                return halt(
                    state,
                    AmiforgeError::step(format!("error creating temporary keypair: {err}")),
                )
            }
        };
        *self.created.lock() = Some(key_pair.name.clone());

        info!(key_pair = %key_pair.name, "Created temporary key pair");
        state.put(KEY_PAIR, key_pair.name);
        state.put(PRIVATE_KEY, key_pair.private_key);
        StepAction::Continue
    }

    async fn cleanup(&self, state: &StateBag) {
        let Some(name) = self.created.lock().take() else {
            return;
        };
        let Ok(ec2) = ec2(state) else {
            return;
        };

        ui(state).say("Deleting temporary keypair...");
        if let Err(err) = ec2.delete_key_pair(&name).await {
            warn!(key_pair = %name, error = %err, "Failed to delete temporary key pair");
            ui(state).error(&format!(
                "Error cleaning up keypair. Please delete the key manually: {name}"
            ));
        }
    }
}
