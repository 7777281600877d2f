//! Copies the AMI to other regions.

use super::create_ami::run_failed;
use super::generated_data::render;
use super::{ec2_for, halt, try_step, ui, wait_for_image, wait_options, Step};
use crate::cancellation::CancellationToken;
use crate::cloud::{destroy_amis, CopyImageRequest};
use crate::config::{AmiConfig, RenderContext};
use crate::context::keys::{AMIS, AMI_NAME, REGION, SNAPSHOTS};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use crate::pipeline::WaiterDefaults;
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{info, warn};

/// Copies the build-region AMI into every `ami_regions` entry, concurrently.
///
/// With `encrypt_boot` the AMI is also copied in place to encrypt it, and
/// the unencrypted original is removed. With `skip_save_build_region` the
/// original is removed once the copies exist.
#[derive(Debug, Default)]
pub struct AmiRegionCopy {
    ami: AmiConfig,
    render_ctx: RenderContext,
    copied: Mutex<Vec<(String, String)>>,
}

impl AmiRegionCopy {
    /// Creates the step.
    #[must_use]
    pub fn new(ami: AmiConfig, render_ctx: RenderContext) -> Self {
        Self {
            ami,
            render_ctx,
            copied: Mutex::new(Vec::new()),
        }
    }

    fn encrypt_in_place(&self) -> bool {
        self.ami.encrypt_boot == Some(true)
    }

    async fn copy_to(
        &self,
        cancel: &CancellationToken,
        state: &StateBag,
        region: &str,
        request: CopyImageRequest,
    ) -> Result<(String, Vec<String>), AmiforgeError> {
        let ec2 = ec2_for(state, region)?;
        let image_id = ec2.copy_image(&request).await.map_err(|err| {
            AmiforgeError::step(format!("error copying AMI to {region}: {err}"))
        })?;
        self.copied.lock().push((region.to_string(), image_id.clone()));
        state.update(AMIS, |amis| {
            amis.insert(region.to_string(), image_id.clone());
        });
        info!(region = %region, image_id = %image_id, "Copying AMI");

        let options = wait_options(state, WaiterDefaults::STANDARD);
        let image = wait_for_image(cancel, ec2.as_ref(), &image_id, options)
            .await
            .map_err(|err| {
                AmiforgeError::step(format!("error waiting for AMI {image_id} in {region}: {err}"))
            })?;
        Ok((image_id, image.snapshot_ids()))
    }
}

#[async_trait]
impl Step for AmiRegionCopy {
    fn name(&self) -> &str {
        "ami_region_copy"
    }

    async fn run(&self, cancel: &CancellationToken, state: &StateBag) -> StepAction {
        let build_region = try_step!(state, state.get(REGION));
        let mut targets = self.ami.ami_regions.clone();
        if self.encrypt_in_place() {
            targets.push(build_region.clone());
        }
        if targets.is_empty() {
            return StepAction::Continue;
        }

        let amis = try_step!(state, state.get(AMIS));
        let Some(source_id) = amis.get(&build_region).cloned() else {
            return halt(state, AmiforgeError::step(format!("no AMI was created in {build_region}")));
        };
        let name = try_step!(state, state.get(AMI_NAME));
        let description = try_step!(state, render(state, &self.render_ctx, &self.ami.ami_description));

        ui(state).say(&format!("Copying/Encrypting AMI ({source_id}) to other regions..."));
        let copies = targets.iter().map(|region| {
            ui(state).message(&format!("Copying to: {region}"));
            let request = CopyImageRequest {
                source_region: build_region.clone(),
                source_image_id: source_id.clone(),
                name: name.clone(),
                description: description.clone(),
                encrypted: self.encrypt_in_place(),
                kms_key_id: self.ami.kms_key_for(region),
            };
            self.copy_to(cancel, state, region, request)
        });
        let results = join_all(copies).await;

        let mut first_error = None;
        for (region, result) in targets.iter().zip(results) {
            match result {
                Ok((_, snapshots)) => state.update(SNAPSHOTS, |all| {
                    all.insert(region.clone(), snapshots);
                }),
                Err(err) => {
                    warn!(region = %region, error = %err, "AMI copy failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return halt(state, err);
        }

        if self.encrypt_in_place() || self.ami.skip_save_build_region {
            ui(state).say(&format!("Deregistering the intermediate AMI {source_id}..."));
            let ec2 = try_step!(state, ec2_for(state, &build_region));
            if let Err(err) = destroy_amis(ec2.as_ref(), &[source_id.clone()], true).await {
                return halt(
                    state,
                    AmiforgeError::step(format!("error deregistering intermediate AMI {source_id}: {err}")),
                );
            }
            if !self.encrypt_in_place() {
                state.update(AMIS, |amis| {
                    amis.remove(&build_region);
                });
                state.update(SNAPSHOTS, |snapshots| {
                    snapshots.remove(&build_region);
                });
            }
        }
        StepAction::Continue
    }

    async fn cleanup(&self, state: &StateBag) {
        let copied = std::mem::take(&mut *self.copied.lock());
        if copied.is_empty() || !run_failed(state) || !self.ami.rollback_image_on_failure {
            return;
        }
        for (region, image_id) in copied {
            let Ok(ec2) = ec2_for(state, &region) else {
                continue;
            };
            ui(state).say(&format!("Deregistering copied AMI {image_id} in {region}..."));
            if let Err(err) = destroy_amis(ec2.as_ref(), &[image_id.clone()], true).await {
                warn!(region = %region, image_id = %image_id, error = %err, "Failed to roll back AMI copy");
                ui(state).error(&format!("Error deregistering AMI {image_id} in {region}: {err}"));
            }
        }
    }
}
