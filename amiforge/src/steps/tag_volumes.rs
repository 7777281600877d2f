//! Records and tags the volumes the volume builder keeps.

use super::generated_data::render_tags;
use super::{ec2, halt, try_step, ui, Step};
use crate::cancellation::CancellationToken;
use crate::config::{BlockDevice, RenderContext};
use crate::context::keys::{EBS_VOLUMES, INSTANCE, REGION};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use async_trait::async_trait;
use tracing::info;

/// Publishes `ebsvolumes` for the build region: the volumes attached at the
/// configured device names. Each volume gets its device's tags.
#[derive(Debug, Default)]
pub struct TagEbsVolumes {
    volumes: Vec<BlockDevice>,
    render_ctx: RenderContext,
}

impl TagEbsVolumes {
    /// Creates the step.
    #[must_use]
    pub fn new(volumes: Vec<BlockDevice>, render_ctx: RenderContext) -> Self {
        Self { volumes, render_ctx }
    }
}

#[async_trait]
impl Step for TagEbsVolumes {
    fn name(&self) -> &str {
        "tag_ebs_volumes"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &StateBag) -> StepAction {
        let ec2 = try_step!(state, ec2(state));
        let region = try_step!(state, state.get(REGION));
        let instance = try_step!(state, state.get(INSTANCE));

        let mut kept = Vec::new();
        for attached in &instance.block_devices {
            let Some(device) = self.volumes.iter().find(|v| v.device_name == attached.device_name) else {
                continue;
            };
            kept.push(attached.volume_id.clone());

            if device.tags.is_empty() {
                continue;
            }
            let tags = try_step!(state, render_tags(state, &self.render_ctx, &device.tags));
            ui(state).say(&format!("Tagging volume {} ({})", attached.volume_id, attached.device_name));
            if let Err(err) = ec2.create_tags(&[attached.volume_id.clone()], &tags).await {
                return halt(
                    state,
                    AmiforgeError::step(format!("error tagging volume {}: {err}", attached.volume_id)),
                );
            }
        }

        info!(region = %region, volumes = ?kept, "Recorded EBS volumes");
        state.update(EBS_VOLUMES, |volumes| {
            volumes.insert(region, kept);
        });
        StepAction::Continue
    }
}
