//! Removes AMIs that already carry the target name.

use super::{ec2_for, halt, try_step, ui, Step};
use crate::cancellation::CancellationToken;
use crate::cloud::{destroy_amis, ImageQuery};
use crate::context::keys::{AMI_NAME, REGION};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use async_trait::async_trait;
use tracing::info;

/// With `force_deregister`, deregisters every AMI named like the one being
/// built, in the build region and every copy region.
#[derive(Debug, Default)]
pub struct DeregisterAmi {
    force_deregister: bool,
    delete_snapshots: bool,
    regions: Vec<String>,
}

impl DeregisterAmi {
    /// Creates the step for the copy `regions`.
    #[must_use]
    pub fn new(force_deregister: bool, delete_snapshots: bool, regions: Vec<String>) -> Self {
        Self {
            force_deregister,
            delete_snapshots,
            regions,
        }
    }
}

#[async_trait]
impl Step for DeregisterAmi {
    fn name(&self) -> &str {
        "deregister_ami"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &StateBag) -> StepAction {
        if !self.force_deregister {
            return StepAction::Continue;
        }
        let name = try_step!(state, state.get(AMI_NAME));
        let build_region = try_step!(state, state.get(REGION));

        let regions = std::iter::once(&build_region).chain(self.regions.iter());
        for region in regions {
            let ec2 = try_step!(state, ec2_for(state, region));
            let images = try_step!(state, ec2.describe_images(&ImageQuery::by_name(&name)).await);
            if images.is_empty() {
                continue;
            }

            let ids: Vec<String> = images.into_iter().map(|image| image.id).collect();
            info!(region = %region, images = ?ids, "Force deregistering AMIs");
            if let Err(err) = destroy_amis(ec2.as_ref(), &ids, self.delete_snapshots).await {
                return halt(
                    state,
                    AmiforgeError::step(format!("error deregistering existing AMI {name} in {region}: {err}")),
                );
            }
            for id in &ids {
                ui(state).say(&format!("Deregistered AMI {name}, id: {id} in {region}"));
            }
        }
        StepAction::Continue
    }
}
