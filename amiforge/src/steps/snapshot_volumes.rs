//! Snapshots the kept volumes that asked for it.

use super::generated_data::{render, render_tags};
use super::{ec2, halt, try_step, ui, wait_for_snapshot, wait_options, Step};
use crate::cancellation::CancellationToken;
use crate::config::{BlockDevice, RenderContext};
use crate::context::keys::{EBS_SNAPSHOTS, INSTANCE, REGION};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use crate::pipeline::WaiterDefaults;
use async_trait::async_trait;
use tracing::info;

/// Snapshots every volume configured with `snapshot_volume`, waits for all
/// of them, tags them and publishes `ebssnapshots` for the build region.
#[derive(Debug, Default)]
pub struct SnapshotEbsVolumes {
    volumes: Vec<BlockDevice>,
    render_ctx: RenderContext,
}

impl SnapshotEbsVolumes {
    /// Creates the step.
    #[must_use]
    pub fn new(volumes: Vec<BlockDevice>, render_ctx: RenderContext) -> Self {
        Self { volumes, render_ctx }
    }
}

#[async_trait]
impl Step for SnapshotEbsVolumes {
    fn name(&self) -> &str {
        "snapshot_ebs_volumes"
    }

    async fn run(&self, cancel: &CancellationToken, state: &StateBag) -> StepAction {
        if !self.volumes.iter().any(|v| v.snapshot_volume) {
            return StepAction::Continue;
        }
        let ec2 = try_step!(state, ec2(state));
        let region = try_step!(state, state.get(REGION));
        let instance = try_step!(state, state.get(INSTANCE));

        let mut started = Vec::new();
        for attached in &instance.block_devices {
            let Some(device) = self
                .volumes
                .iter()
                .find(|v| v.snapshot_volume && v.device_name == attached.device_name)
            else {
                continue;
            };
            let description = try_step!(state, render(state, &self.render_ctx, &device.snapshot_description));
            ui(state).say(&format!("Creating snapshot of EBS volume: {}", attached.volume_id));
            let snapshot_id = match ec2.create_snapshot(&attached.volume_id, &description).await {
                Ok(id) => id,
                Err(err) => {
                    return halt(
                        state,
                        AmiforgeError::step(format!(
                            "error creating snapshot of volume {}: {err}",
                            attached.volume_id
                        )),
                    )
                }
            };
            info!(volume_id = %attached.volume_id, snapshot_id = %snapshot_id, "Snapshot started");
            state.update(EBS_SNAPSHOTS, |snapshots| {
                snapshots.entry(region.clone()).or_default().push(snapshot_id.clone());
            });
            started.push((snapshot_id, device));
        }

        let options = wait_options(state, WaiterDefaults::STANDARD);
        for (snapshot_id, device) in started {
            ui(state).message(&format!("Waiting for snapshot {snapshot_id} to complete..."));
            if let Err(err) = wait_for_snapshot(cancel, ec2.as_ref(), &snapshot_id, options).await {
                return halt(
                    state,
                    AmiforgeError::step(format!("error waiting for snapshot {snapshot_id}: {err}")),
                );
            }

            if device.snapshot_tags.is_empty() {
                continue;
            }
            let tags = try_step!(state, render_tags(state, &self.render_ctx, &device.snapshot_tags));
            if let Err(err) = ec2.create_tags(&[snapshot_id.clone()], &tags).await {
                return halt(
                    state,
                    AmiforgeError::step(format!("error tagging snapshot {snapshot_id}: {err}")),
                );
            }
        }
        StepAction::Continue
    }
}
