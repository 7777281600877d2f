//! On-demand launch of the source instance.

use super::generated_data::{launch_data, publish, render, render_tags};
use super::{ec2, halt, try_step, ui, wait_options, Step};
use crate::cancellation::CancellationToken;
use crate::cloud::{Ec2Api, InstanceState, RunInstancesRequest, Tags};
use crate::config::{to_mappings, BlockDevice, RenderContext, RunConfig};
use crate::context::keys::{
    AVAILABILITY_ZONE, IAM_INSTANCE_PROFILE, INSTANCE, INSTANCE_ID, KEY_PAIR, SECURITY_GROUP_IDS,
    SOURCE_IMAGE, SUBNET_ID,
};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use crate::pipeline::WaiterDefaults;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Launch parameters shared by the on-demand and spot launch steps.
#[derive(Debug, Clone, Default)]
pub struct LaunchSettings {
    /// Instance type.
    pub instance_type: String,
    /// User data.
    pub user_data: String,
    /// Launch EBS-optimized.
    pub ebs_optimized: bool,
    /// Associate a public address.
    pub associate_public_ip_address: Option<bool>,
    /// `stop` or `terminate`.
    pub shutdown_behavior: String,
    /// Root and data volumes attached at launch.
    pub block_devices: Vec<BlockDevice>,
    /// Tags for the instance; values may be templates.
    pub run_tags: Tags,
    /// Tags for every volume created at launch; values may be templates.
    pub volume_tags: Tags,
    /// Resolved tenancy.
    pub tenancy: Option<String>,
    /// Host resource group for dedicated hosts.
    pub host_resource_group_arn: String,
    /// Context for rendering tag values.
    pub render_ctx: RenderContext,
}

impl LaunchSettings {
    /// Takes launch parameters from the run configuration.
    #[must_use]
    pub fn from_config(config: &RunConfig, block_devices: Vec<BlockDevice>, render_ctx: RenderContext) -> Self {
        Self {
            instance_type: config.instance_type.clone(),
            user_data: config.user_data.clone(),
            ebs_optimized: config.ebs_optimized,
            associate_public_ip_address: config.associate_public_ip_address,
            shutdown_behavior: config.shutdown_behavior.clone(),
            block_devices,
            run_tags: config.run_tags.clone(),
            volume_tags: config.run_volume_tags.clone(),
            tenancy: config.tenancy(),
            host_resource_group_arn: config.placement.host_resource_group_arn.clone(),
            render_ctx,
        }
    }

    /// Per-device volume tag plan; `""` applies to every volume.
    fn volume_tag_plan(&self, state: &StateBag) -> Result<BTreeMap<String, Tags>, AmiforgeError> {
        let mut plan = BTreeMap::new();
        if !self.volume_tags.is_empty() {
            plan.insert(String::new(), render_tags(state, &self.render_ctx, &self.volume_tags)?);
        }
        for device in self.block_devices.iter().filter(|d| !d.tags.is_empty()) {
            plan.insert(
                device.device_name.clone(),
                render_tags(state, &self.render_ctx, &device.tags)?,
            );
        }
        Ok(plan)
    }

    /// Builds the launch request from the settings and the resolved state.
    ///
    /// # Errors
    ///
    /// Fails if the source image is missing or not EBS-backed, or if a tag
    /// does not render.
    pub fn request(&self, state: &StateBag) -> Result<RunInstancesRequest, AmiforgeError> {
        let image = state.get(SOURCE_IMAGE)?;
        if !image.is_ebs_backed() {
            return Err(AmiforgeError::step(format!(
                "the provided source AMI has an invalid root device type; expected 'ebs', got '{}'",
                image.root_device_type
            )));
        }

        let mut instance_tags = render_tags(state, &self.render_ctx, &self.run_tags)?;
        instance_tags
            .entry("Name".to_string())
            .or_insert_with(|| "Packer Builder".to_string());

        let user_data = if self.user_data.is_empty() {
            None
        } else {
            Some(render(state, &self.render_ctx, &self.user_data)?)
        };

        let subnet_id = state.get_ok(SUBNET_ID);
        Ok(RunInstancesRequest {
            image_id: image.id,
            instance_type: self.instance_type.clone(),
            key_name: state.get_ok(KEY_PAIR),
            security_group_ids: state.get_ok(SECURITY_GROUP_IDS).unwrap_or_default(),
            availability_zone: if subnet_id.is_none() {
                state.get_ok(AVAILABILITY_ZONE)
            } else {
                None
            },
            subnet_id,
            iam_instance_profile: state.get_ok(IAM_INSTANCE_PROFILE),
            user_data,
            ebs_optimized: self.ebs_optimized,
            tenancy: self.tenancy.clone(),
            host_resource_group_arn: (!self.host_resource_group_arn.is_empty())
                .then(|| self.host_resource_group_arn.clone()),
            associate_public_ip_address: self.associate_public_ip_address,
            shutdown_behavior: (!self.shutdown_behavior.is_empty())
                .then(|| self.shutdown_behavior.clone()),
            block_device_mappings: to_mappings(&self.block_devices),
            instance_tags,
            volume_tags: self.volume_tag_plan(state)?,
        })
    }
}

/// Launches the source instance on demand.
///
/// Publishes `instance_id` as soon as the instance exists, then `instance`
/// once it is running. Cleanup terminates it.
#[derive(Debug, Default)]
pub struct RunSourceInstance {
    settings: LaunchSettings,
    created: Mutex<Option<String>>,
}

impl RunSourceInstance {
    /// Creates the step.
    #[must_use]
    pub fn new(settings: LaunchSettings) -> Self {
        Self {
            settings,
            created: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Step for RunSourceInstance {
    fn name(&self) -> &str {
        "run_source_instance"
    }

    async fn run(&self, cancel: &CancellationToken, state: &StateBag) -> StepAction {
        let ec2 = try_step!(state, ec2(state));
        let request = try_step!(state, self.settings.request(state));

        ui(state).say("Launching a source AWS instance...");
        let instance = match ec2.run_instances(&request).await {
            Ok(instance) => instance,
            Err(err) => {
                return halt(state, AmiforgeError::step(format!("error launching source instance: {err}")))
            }
        };
        let instance_id = instance.id.clone();
        *self.created.lock() = Some(instance_id.clone());
        state.put(INSTANCE_ID, instance_id.clone());
        info!(instance_id = %instance_id, image_id = %request.image_id, "Launched source instance");
        ui(state).message(&format!("Instance ID: {instance_id}"));

        ui(state).say(&format!("Waiting for instance ({instance_id}) to become ready..."));
        let options = wait_options(state, WaiterDefaults::STANDARD);
        let instance =
            match super::wait_for_instance(cancel, ec2.as_ref(), &instance_id, InstanceState::Running, options)
                .await
            {
                Ok(instance) => instance,
                Err(err) => {
                    return halt(
                        state,
                        AmiforgeError::step(format!(
                            "error waiting for instance ({instance_id}) to become ready: {err}"
                        )),
                    )
                }
            };

        state.put(INSTANCE, instance);
        publish(state, launch_data(state));
        StepAction::Continue
    }

    async fn cleanup(&self, state: &StateBag) {
        let Some(instance_id) = self.created.lock().take() else {
            return;
        };
        let Ok(ec2) = ec2(state) else {
            return;
        };
        terminate(state, ec2.as_ref(), &instance_id).await;
    }
}

/// Terminates an instance and waits until it is gone. Failures are reported only.
pub(crate) async fn terminate(state: &StateBag, ec2: &dyn Ec2Api, instance_id: &str) {
    ui(state).say("Terminating the source AWS instance...");
    if let Err(err) = ec2.terminate_instance(instance_id).await {
        warn!(instance_id = %instance_id, error = %err, "Failed to terminate instance");
        ui(state).error(&format!("Error terminating instance, may still be around: {err}"));
        return;
    }

    let options = wait_options(state, WaiterDefaults::STANDARD);
    let waited = super::wait_for_instance(
        &CancellationToken::new(),
        ec2,
        instance_id,
        InstanceState::Terminated,
        options,
    )
    .await;
    if let Err(err) = waited {
        warn!(instance_id = %instance_id, error = %err, "Instance did not terminate");
        ui(state).error(&err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::Image;
    use pretty_assertions::assert_eq;

    fn source() -> Image {
        Image {
            id: "ami-source".to_string(),
            root_device_type: "ebs".to_string(),
            ..Image::default()
        }
    }

    #[test]
    fn test_request_uses_resolved_state() {
        let state = StateBag::new();
        state.put(SOURCE_IMAGE, source());
        state.put(SUBNET_ID, "subnet-1".to_string());
        state.put(AVAILABILITY_ZONE, "us-east-1a".to_string());
        state.put(KEY_PAIR, "packer_tmp".to_string());
        state.put(SECURITY_GROUP_IDS, vec!["sg-1".to_string()]);

        let settings = LaunchSettings {
            instance_type: "t3.micro".to_string(),
            tenancy: Some("dedicated".to_string()),
            ..LaunchSettings::default()
        };
        let request = settings.request(&state).unwrap();

        assert_eq!(request.image_id, "ami-source");
        assert_eq!(request.subnet_id.as_deref(), Some("subnet-1"));
        assert_eq!(request.availability_zone, None);
        assert_eq!(request.key_name.as_deref(), Some("packer_tmp"));
        assert_eq!(request.tenancy.as_deref(), Some("dedicated"));
        assert_eq!(request.instance_tags["Name"], "Packer Builder");
    }

    #[test]
    fn test_volume_tag_plan() {
        let state = StateBag::new();
        state.put(SOURCE_IMAGE, source());

        let mut volume_tags = Tags::new();
        volume_tags.insert("Team".to_string(), "images".to_string());
        let mut data_tags = Tags::new();
        data_tags.insert("Role".to_string(), "data".to_string());

        let settings = LaunchSettings {
            volume_tags,
            block_devices: vec![BlockDevice {
                device_name: "/dev/sdf".to_string(),
                volume_size: 10,
                tags: data_tags,
                ..BlockDevice::default()
            }],
            ..LaunchSettings::default()
        };
        let request = settings.request(&state).unwrap();

        assert_eq!(request.volume_tags[""]["Team"], "images");
        assert_eq!(request.volume_tags["/dev/sdf"]["Role"], "data");
        assert_eq!(request.block_device_mappings.len(), 1);
    }

    #[test]
    fn test_instance_store_source_rejected() {
        let state = StateBag::new();
        state.put(
            SOURCE_IMAGE,
            Image {
                root_device_type: "instance-store".to_string(),
                ..source()
            },
        );
        let err = LaunchSettings::default().request(&state).unwrap_err();
        assert!(err.to_string().contains("invalid root device type"));
    }
}
