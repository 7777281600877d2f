//! Applies launch permissions, description and other attributes to every AMI.

use super::generated_data::render;
use super::{ec2_for, halt, try_step, ui, Step};
use crate::cancellation::CancellationToken;
use crate::cloud::Ec2Api;
use crate::config::{AmiConfig, RenderContext};
use crate::context::keys::{AMIS, SNAPSHOTS};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::{AmiforgeError, CloudError};
use async_trait::async_trait;
use tracing::info;

/// Applies each configured attribute with its own call, per region.
///
/// A failing attribute halts the build; attributes applied before it stay
/// applied.
#[derive(Debug, Default)]
pub struct ModifyAmiAttributes {
    ami: AmiConfig,
    render_ctx: RenderContext,
}

impl ModifyAmiAttributes {
    /// Creates the step.
    #[must_use]
    pub fn new(ami: AmiConfig, render_ctx: RenderContext) -> Self {
        Self { ami, render_ctx }
    }

    async fn modify(
        &self,
        ec2: &dyn Ec2Api,
        state: &StateBag,
        image_id: &str,
        snapshot_ids: &[String],
        description: &str,
    ) -> Result<(), AmiforgeError> {
        let region = ec2.region().to_string();
        let wrap = |what: &str, err: CloudError| {
            AmiforgeError::step(format!("error modifying {what} of AMI {image_id} in {region}: {err}"))
        };

        for (name, change) in self.ami.modifications(description) {
            ui(state).say(&format!("Modifying: {name}"));
            ec2.modify_image_attribute(image_id, &change)
                .await
                .map_err(|err| wrap(name, err))?;
        }

        let users = &self.ami.snapshot_users;
        let groups = &self.ami.snapshot_groups;
        if !users.is_empty() || !groups.is_empty() {
            for snapshot_id in snapshot_ids {
                ui(state).say(&format!("Modifying create volume permission of snapshot {snapshot_id}"));
                ec2.modify_snapshot_create_volume_permission(snapshot_id, users, groups)
                    .await
                    .map_err(|err| wrap("snapshot permissions", err))?;
            }
        }

        if let Some(deprecate_at) = self.ami.deprecation_time() {
            ui(state).say(&format!("Enabling deprecation on AMI ({image_id}) in region {region:?}"));
            ec2.enable_image_deprecation(image_id, deprecate_at)
                .await
                .map_err(|err| wrap("deprecation", err))?;
        }

        let protection = self.ami.deregistration_protection;
        if protection.enabled || protection.with_cooldown {
            ui(state).say(&format!(
                "Enabling deregistration protection on AMI ({image_id}) in region {region:?}"
            ));
            ec2.enable_image_deregistration_protection(image_id, protection.with_cooldown)
                .await
                .map_err(|err| wrap("deregistration protection", err))?;
        }

        info!(region = %region, image_id = %image_id, "AMI attributes applied");
        Ok(())
    }
}

#[async_trait]
impl Step for ModifyAmiAttributes {
    fn name(&self) -> &str {
        "modify_ami_attributes"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &StateBag) -> StepAction {
        let Some(amis) = state.get_ok(AMIS) else {
            return StepAction::Continue;
        };
        let snapshots = state.get_ok(SNAPSHOTS).unwrap_or_default();
        let description = try_step!(state, render(state, &self.render_ctx, &self.ami.ami_description));

        for (region, image_id) in &amis {
            let ec2 = try_step!(state, ec2_for(state, region));
            let snapshot_ids = snapshots.get(region).map(Vec::as_slice).unwrap_or_default();
            ui(state).say(&format!("Modifying attributes on AMI ({image_id})..."));
            if let Err(err) = self
                .modify(ec2.as_ref(), state, image_id, snapshot_ids, &description)
                .await
            {
                return halt(state, err);
            }
        }
        StepAction::Continue
    }
}
