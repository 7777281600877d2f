//! Stops the EBS-backed source instance before it is imaged.

use super::{ec2, halt, try_step, ui, wait_for_instance, wait_options, Step};
use crate::cancellation::CancellationToken;
use crate::cloud::InstanceState;
use crate::context::keys::{INSTANCE, INSTANCE_ID};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::{AmiforgeError, CloudError};
use crate::pipeline::{RetryConfig, WaiterDefaults};
use async_trait::async_trait;
use tracing::info;

/// Stops the instance and waits until it is `stopped`.
///
/// With `disable_stop_instance` the instance is expected to stop itself
/// (e.g. a provisioner shuts it down) and the step only waits. Spot
/// instances cannot be stopped and are skipped.
#[derive(Debug, Default)]
pub struct StopInstance {
    skip: bool,
    disable_stop: bool,
}

impl StopInstance {
    /// Creates the step.
    #[must_use]
    pub const fn new(spot: bool, disable_stop: bool) -> Self {
        Self {
            skip: spot,
            disable_stop,
        }
    }
}

#[async_trait]
impl Step for StopInstance {
    fn name(&self) -> &str {
        "stop_instance"
    }

    async fn run(&self, cancel: &CancellationToken, state: &StateBag) -> StepAction {
        if self.skip {
            return StepAction::Continue;
        }
        let ec2 = try_step!(state, ec2(state));
        let instance_id = try_step!(state, state.get(INSTANCE_ID));

        if self.disable_stop {
            ui(state).say("Automatic instance stop disabled. Please stop instance manually.");
        } else {
            ui(state).say("Stopping the source instance...");
            // A fresh instance can briefly be invisible to StopInstances.
            let stopped = RetryConfig::default()
                .with_tries(11)
                .run_if(
                    cancel,
                    "StopInstances",
                    |err: &CloudError| err.is_not_found(),
                    || ec2.stop_instance(&instance_id),
                )
                .await;
            if let Err(err) = stopped {
                return halt(state, AmiforgeError::step(format!("error stopping instance: {err}")));
            }
        }

        ui(state).say("Waiting for the instance to stop...");
        let options = wait_options(state, WaiterDefaults::STANDARD);
        match wait_for_instance(cancel, ec2.as_ref(), &instance_id, InstanceState::Stopped, options).await {
            Ok(instance) => {
                info!(instance_id = %instance_id, "Instance stopped");
                state.put(INSTANCE, instance);
                StepAction::Continue
            }
            Err(err) => halt(
                state,
                AmiforgeError::step(format!("error waiting for instance to stop: {err}")),
            ),
        }
    }
}
