//! Network attributes set on the stopped instance so the image inherits them.

use super::{ec2, halt, try_step, ui, Step};
use crate::cancellation::CancellationToken;
use crate::cloud::InstanceAttribute;
use crate::context::keys::INSTANCE_ID;
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use async_trait::async_trait;

/// Enables SR-IOV and sets ENA support on the instance.
#[derive(Debug, Default)]
pub struct ModifyEbsBackedInstance {
    sriov_support: bool,
    ena_support: Option<bool>,
}

impl ModifyEbsBackedInstance {
    /// Creates the step.
    #[must_use]
    pub const fn new(sriov_support: bool, ena_support: Option<bool>) -> Self {
        Self {
            sriov_support,
            ena_support,
        }
    }

    fn attributes(&self) -> Vec<InstanceAttribute> {
        let mut attributes = Vec::new();
        if self.sriov_support {
            attributes.push(InstanceAttribute::SriovNetSupport("simple".to_string()));
        }
        if let Some(enabled) = self.ena_support {
            attributes.push(InstanceAttribute::EnaSupport(enabled));
        }
        attributes
    }
}

#[async_trait]
impl Step for ModifyEbsBackedInstance {
    fn name(&self) -> &str {
        "modify_ebs_backed_instance"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &StateBag) -> StepAction {
        let attributes = self.attributes();
        if attributes.is_empty() {
            return StepAction::Continue;
        }
        let ec2 = try_step!(state, ec2(state));
        let instance_id = try_step!(state, state.get(INSTANCE_ID));

        for attribute in &attributes {
            let label = match attribute {
                InstanceAttribute::SriovNetSupport(_) => "SR-IOV",
                InstanceAttribute::EnaSupport(true) => "ENA",
                InstanceAttribute::EnaSupport(false) => "ENA (disable)",
            };
            ui(state).say(&format!("Setting {label} support on the source instance"));
            if let Err(err) = ec2.modify_instance_attribute(&instance_id, attribute).await {
                return halt(
                    state,
                    AmiforgeError::step(format!("error setting {label} support on {instance_id}: {err}")),
                );
            }
        }
        StepAction::Continue
    }
}
