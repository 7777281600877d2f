//! Builds an EBS-backed AMI from a temporary instance.

use super::{execute, BuildServices};
use crate::cancellation::CancellationToken;
use crate::config::{prepare_devices, AccessConfig, AmiConfig, BlockDevice, RenderContext, RunConfig};
use crate::context::keys::{AMIS, GENERATED_DATA};
use crate::core::{Artifact, EBS_BUILDER_ID};
use crate::errors::{AmiforgeError, ConfigErrors};
use crate::steps::{
    AmiNamePreValidate, AmiRegionCopy, CleanupTempKeys, Connect, CreateAmi, CreateTags,
    DeregisterAmi, IamInstanceProfile, KeyPairStep, LaunchSettings, ModifyAmiAttributes,
    ModifyEbsBackedInstance, NetworkInfo, Provision, RunSourceInstance, RunSpotInstance,
    SecurityGroupStep, SetGeneratedData, SourceAmiInfo, Step, StopInstance,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Settings of the AMI builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EbsConfig {
    /// Credentials and region.
    #[serde(flatten)]
    pub access: AccessConfig,
    /// The temporary instance.
    #[serde(flatten)]
    pub run: RunConfig,
    /// The AMI and its copies.
    #[serde(flatten)]
    pub ami: AmiConfig,
    /// Devices attached at launch.
    pub launch_block_device_mappings: Vec<BlockDevice>,
    /// Devices recorded in the AMI.
    pub ami_block_device_mappings: Vec<BlockDevice>,
}

impl EbsConfig {
    /// Applies defaults and validates every block.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn prepare(&mut self) -> Result<(), ConfigErrors> {
        let mut errs = ConfigErrors::new();
        errs.merge(self.access.prepare());
        errs.merge(self.run.prepare());
        errs.merge(self.ami.prepare(&self.access.region));
        errs.merge(prepare_devices(&self.launch_block_device_mappings));
        errs.merge(prepare_devices(&self.ami_block_device_mappings));

        if self.run.is_spot_instance() && (self.ami.ena_support == Some(true) || self.ami.sriov_support) {
            errs.push(
                "spot instances do not support modification, which is required when either \
                 ena_support or sriov_support are set; use an AMI that already has SR-IOV or ENA enabled",
            );
        }
        if self.run.shutdown_behavior == "terminate" {
            errs.push("shutdown_behavior terminate would destroy the instance before the AMI is created");
        }

        errs.into_result()
    }
}

/// Builds an AMI by launching an instance from a source image, provisioning
/// it, stopping it and capturing it, then copying and sharing the result.
#[derive(Debug)]
pub struct EbsBuilder {
    config: EbsConfig,
}

impl EbsBuilder {
    /// Validates `config` and returns a builder for it.
    ///
    /// # Errors
    ///
    /// Returns every configuration problem before any remote call is made.
    pub fn new(mut config: EbsConfig) -> Result<Self, ConfigErrors> {
        config.prepare()?;
        Ok(Self { config })
    }

    /// The validated configuration.
    #[must_use]
    pub const fn config(&self) -> &EbsConfig {
        &self.config
    }

    /// The steps of one run, in order.
    ///
    /// # Errors
    ///
    /// Fails if the services cannot satisfy the configuration.
    pub fn steps(&self, services: &BuildServices) -> Result<Vec<Arc<dyn Step>>, AmiforgeError> {
        let EbsConfig { run, ami, .. } = &self.config;
        let ctx = RenderContext::new();
        let comm = &run.communicator;
        let settings = LaunchSettings::from_config(
            run,
            self.config.launch_block_device_mappings.clone(),
            ctx.clone(),
        );

        let instance: Arc<dyn Step> = if run.is_spot_instance() {
            Arc::new(
                RunSpotInstance::new(settings, run.spot_price.clone())
                    .with_instance_types(run.spot_instance_types.clone())
                    .with_spot_tags(run.spot_tags.clone()),
            )
        } else {
            Arc::new(RunSourceInstance::new(settings))
        };

        Ok(vec![
            Arc::new(
                SourceAmiInfo::new(run.source_ami.clone(), run.source_ami_filter.clone())
                    .with_ena_support(ami.ena_support),
            ),
            Arc::new(
                AmiNamePreValidate::new(ami.ami_name.clone(), ctx.clone())
                    .with_force_deregister(ami.force_deregister),
            ),
            Arc::new(NetworkInfo {
                vpc_id: run.vpc_id.clone(),
                subnet_id: run.subnet_id.clone(),
                subnet_filter: run.subnet_filter.clone(),
                availability_zone: run.availability_zone.clone(),
            }),
            Arc::new(KeyPairStep::new(comm.clone())),
            Arc::new(
                SecurityGroupStep::new(comm.port())
                    .with_group_ids(run.security_group_ids.clone())
                    .with_filter(run.security_group_filter.clone())
                    .with_source_cidrs(run.temporary_sg_source_cidrs.clone())
                    .with_skip_ingress_rule(run.ssm_agent_enabled()),
            ),
            Arc::new(
                IamInstanceProfile::new(run.iam_instance_profile.clone())
                    .with_skip_validation(run.skip_profile_validation)
                    .with_temporary_policy(run.temporary_iam_instance_profile_policy_document.clone()),
            ),
            instance,
            Arc::new(services.ssm_tunnel(run)?),
            Arc::new(Connect::new(comm.clone(), services.connector())),
            Arc::new(SetGeneratedData),
            Arc::new(Provision),
            Arc::new(CleanupTempKeys::new(comm.clone())),
            Arc::new(StopInstance::new(run.is_spot_instance(), run.disable_stop_instance)),
            Arc::new(ModifyEbsBackedInstance::new(ami.sriov_support, ami.ena_support)),
            Arc::new(DeregisterAmi::new(
                ami.force_deregister,
                ami.force_delete_snapshot,
                ami.ami_regions.clone(),
            )),
            Arc::new(
                CreateAmi::new(ami.ami_description.clone(), ctx.clone())
                    .with_ami_devices(self.config.ami_block_device_mappings.clone())
                    .with_rollback_on_failure(ami.rollback_image_on_failure),
            ),
            Arc::new(AmiRegionCopy::new(ami.clone(), ctx.clone())),
            Arc::new(ModifyAmiAttributes::new(ami.clone(), ctx.clone())),
            Arc::new(CreateTags::new(ami.tags.clone(), ami.snapshot_tags.clone(), ctx)),
        ])
    }

    /// Runs the build.
    ///
    /// Returns `None` if the run finished without registering an AMI.
    ///
    /// # Errors
    ///
    /// Returns the error of the step that halted the run, or the
    /// cancellation.
    pub async fn run(
        &self,
        services: &BuildServices,
        cancel: &CancellationToken,
    ) -> Result<Option<Artifact>, AmiforgeError> {
        let steps = self.steps(services)?;
        let state = services.state_for(&self.config.access, &self.config.run);

        execute(EBS_BUILDER_ID, steps, cancel, &state).await?;

        let amis = state.get_ok(AMIS).unwrap_or_default();
        if amis.is_empty() {
            return Ok(None);
        }
        let artifact = Artifact::amis(EBS_BUILDER_ID, amis, services.cloud())
            .with_state_data(state.get_ok(GENERATED_DATA).unwrap_or_default());
        info!(artifact = %artifact.id(), "AMIs created");
        Ok(Some(artifact))
    }
}
