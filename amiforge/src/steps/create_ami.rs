//! Captures the stopped instance as an AMI.

use super::generated_data::render;
use super::{ec2, halt, try_step, ui, wait_for_image, wait_options, Step};
use crate::cancellation::CancellationToken;
use crate::cloud::{destroy_amis, CreateImageRequest};
use crate::config::{to_mappings, BlockDevice, RenderContext};
use crate::context::keys::{AMIS, AMI_NAME, CANCELLED, HALTED, INSTANCE_ID, REGION, SNAPSHOTS};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use crate::pipeline::WaiterDefaults;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

/// True once the runner has recorded a halt or a cancellation.
pub(crate) fn run_failed(state: &StateBag) -> bool {
    state.get_ok(HALTED).unwrap_or(false) || state.get_ok(CANCELLED).unwrap_or(false)
}

/// Creates the AMI and publishes it under `amis` and its snapshots under
/// `snapshots`, keyed by the build region.
///
/// A created AMI is kept when a later step fails, unless
/// `rollback_image_on_failure` asks for it to be deregistered.
#[derive(Debug, Default)]
pub struct CreateAmi {
    description: String,
    ami_devices: Vec<BlockDevice>,
    rollback_on_failure: bool,
    render_ctx: RenderContext,
    created: Mutex<Option<String>>,
}

impl CreateAmi {
    /// Creates the step. `description` may be a template.
    #[must_use]
    pub fn new(description: impl Into<String>, render_ctx: RenderContext) -> Self {
        Self {
            description: description.into(),
            render_ctx,
            ..Self::default()
        }
    }

    /// Extra devices and overrides recorded in the AMI.
    #[must_use]
    pub fn with_ami_devices(mut self, devices: Vec<BlockDevice>) -> Self {
        self.ami_devices = devices;
        self
    }

    /// Deregisters the AMI during cleanup if the build fails later on.
    #[must_use]
    pub const fn with_rollback_on_failure(mut self, rollback: bool) -> Self {
        self.rollback_on_failure = rollback;
        self
    }
}

#[async_trait]
impl Step for CreateAmi {
    fn name(&self) -> &str {
        "create_ami"
    }

    async fn run(&self, cancel: &CancellationToken, state: &StateBag) -> StepAction {
        let ec2 = try_step!(state, ec2(state));
        let region = try_step!(state, state.get(REGION));
        let instance_id = try_step!(state, state.get(INSTANCE_ID));
        let name = try_step!(state, state.get(AMI_NAME));
        let description = try_step!(state, render(state, &self.render_ctx, &self.description));

        ui(state).say(&format!("Creating AMI {name} from instance {instance_id}"));
        let request = CreateImageRequest {
            instance_id: instance_id.clone(),
            name: name.clone(),
            description,
            block_device_mappings: to_mappings(&self.ami_devices),
        };
        let image_id = match ec2.create_image(&request).await {
            Ok(id) => id,
            Err(err) => return halt(state, AmiforgeError::step(format!("error creating AMI: {err}"))),
        };

        *self.created.lock() = Some(image_id.clone());
        state.update(AMIS, |amis| {
            amis.insert(region.clone(), image_id.clone());
        });
        info!(image_id = %image_id, instance_id = %instance_id, "Created AMI");
        ui(state).message(&format!("AMI: {image_id}"));

        ui(state).say("Waiting for AMI to become ready...");
        let options = wait_options(state, WaiterDefaults::STANDARD);
        let image = match wait_for_image(cancel, ec2.as_ref(), &image_id, options).await {
            Ok(image) => image,
            Err(err) => {
                return halt(
                    state,
                    AmiforgeError::step(format!("error waiting for AMI {image_id}: {err}")),
                )
            }
        };

        state.update(SNAPSHOTS, |snapshots| {
            snapshots.insert(region.clone(), image.snapshot_ids());
        });
        StepAction::Continue
    }

    async fn cleanup(&self, state: &StateBag) {
        let Some(image_id) = self.created.lock().take() else {
            return;
        };
        if !run_failed(state) {
            return;
        }

        if !self.rollback_on_failure {
            warn!(image_id = %image_id, "Build failed after the AMI was created; keeping it");
            ui(state).error(&format!(
                "AMI {image_id} was created but the build did not finish; it has been kept"
            ));
            return;
        }

        let Ok(ec2) = ec2(state) else {
            return;
        };
        ui(state).say("Deregistering the AMI and deleting associated snapshots because of cancellation, or error...");
        if let Err(err) = destroy_amis(ec2.as_ref(), &[image_id.clone()], true).await {
            warn!(image_id = %image_id, error = %err, "Failed to roll back AMI");
            ui(state).error(&format!("Error deregistering AMI {image_id}, may still be around: {err}"));
        }
    }
}
