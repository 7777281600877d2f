//! Hands the connected instance to the provisioning hook.

use super::connect::Communicator;
use super::{halt, ui, Step};
use crate::cancellation::CancellationToken;
use crate::context::keys::{COMMUNICATOR, HOOK};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Event fired once the instance is reachable.
pub const HOOK_PROVISION: &str = "packer_provision";

/// Runs provisioners against the instance.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Handles `event`. `communicator` is absent when connecting was disabled.
    async fn run(
        &self,
        cancel: &CancellationToken,
        event: &str,
        communicator: Option<Arc<dyn Communicator>>,
    ) -> Result<(), AmiforgeError>;
}

/// Runs the `hook` published in the state bag, if any.
#[derive(Debug, Default)]
pub struct Provision;

#[async_trait]
impl Step for Provision {
    fn name(&self) -> &str {
        "provision"
    }

    async fn run(&self, cancel: &CancellationToken, state: &StateBag) -> StepAction {
        let Some(hook) = state.get_ok(HOOK) else {
            return StepAction::Continue;
        };

        ui(state).say("Provisioning with the configured provisioners...");
        info!(event = HOOK_PROVISION, "Running provisioning hook");
        match hook.run(cancel, HOOK_PROVISION, state.get_ok(COMMUNICATOR)).await {
            Ok(()) => StepAction::Continue,
            Err(err) if err.is_cancelled() => halt(state, err),
            Err(err) => halt(state, AmiforgeError::step(format!("error provisioning: {err}"))),
        }
    }
}
