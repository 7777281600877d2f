//! Builds standalone EBS volumes (and optional snapshots) from a temporary
//! instance.

use super::{execute, BuildServices};
use crate::cancellation::CancellationToken;
use crate::config::{prepare_devices, AccessConfig, BlockDevice, RenderContext, RunConfig};
use crate::context::keys::{EBS_SNAPSHOTS, EBS_VOLUMES, GENERATED_DATA};
use crate::core::{Artifact, EBS_VOLUME_BUILDER_ID};
use crate::errors::{AmiforgeError, ConfigErrors};
use crate::steps::{
    CleanupTempKeys, Connect, IamInstanceProfile, KeyPairStep, LaunchSettings,
    ModifyEbsBackedInstance, NetworkInfo, Provision, RunSourceInstance, RunSpotInstance,
    SecurityGroupStep, SetGeneratedData, SnapshotEbsVolumes, SourceAmiInfo, Step, StopInstance,
    TagEbsVolumes,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Settings of the volume builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EbsVolumeConfig {
    /// Credentials and region.
    #[serde(flatten)]
    pub access: AccessConfig,
    /// The temporary instance.
    #[serde(flatten)]
    pub run: RunConfig,
    /// Enable ENA on the instance before it is stopped.
    pub ena_support: Option<bool>,
    /// Enable SR-IOV on the instance before it is stopped.
    pub sriov_support: bool,
    /// The volumes to create and keep.
    pub ebs_volumes: Vec<BlockDevice>,
}

impl EbsVolumeConfig {
    /// Validates every block.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn prepare(&mut self) -> Result<(), ConfigErrors> {
        let mut errs = ConfigErrors::new();
        errs.merge(self.access.prepare());
        errs.merge(self.run.prepare());
        errs.merge(prepare_devices(&self.ebs_volumes));

        if self.run.is_spot_instance() && (self.ena_support == Some(true) || self.sriov_support) {
            errs.push(
                "spot instances do not support modification, which is required when either \
                 ena_support or sriov_support are set; use an AMI that already has SR-IOV or ENA enabled",
            );
        }

        errs.into_result()
    }
}

/// Launches an instance with the configured volumes attached, provisions it
/// and keeps the volumes after the instance is terminated.
#[derive(Debug)]
pub struct EbsVolumeBuilder {
    config: EbsVolumeConfig,
}

impl EbsVolumeBuilder {
    /// Validates `config` and returns a builder for it.
    ///
    /// # Errors
    ///
    /// Returns every configuration problem before any remote call is made.
    pub fn new(mut config: EbsVolumeConfig) -> Result<Self, ConfigErrors> {
        config.prepare()?;
        Ok(Self { config })
    }

    /// The steps of one run, in order.
    ///
    /// # Errors
    ///
    /// Fails if the services cannot satisfy the configuration.
    pub fn steps(&self, services: &BuildServices) -> Result<Vec<Arc<dyn Step>>, AmiforgeError> {
        let run = &self.config.run;
        let volumes = &self.config.ebs_volumes;
        let ctx = RenderContext::new();
        let comm = &run.communicator;
        let settings = LaunchSettings::from_config(run, volumes.clone(), ctx.clone());

        let instance: Arc<dyn Step> = if run.is_spot_instance() {
            info!("Using a spot instance to create EBS volumes");
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
                    .with_ena_support(self.config.ena_support),
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
            Arc::new(TagEbsVolumes::new(volumes.clone(), ctx.clone())),
            Arc::new(services.ssm_tunnel(run)?),
            Arc::new(Connect::new(comm.clone(), services.connector())),
            Arc::new(SetGeneratedData),
            Arc::new(Provision),
            Arc::new(CleanupTempKeys::new(comm.clone())),
            Arc::new(StopInstance::new(run.is_spot_instance(), run.disable_stop_instance)),
            Arc::new(ModifyEbsBackedInstance::new(
                self.config.sriov_support,
                self.config.ena_support,
            )),
            Arc::new(SnapshotEbsVolumes::new(volumes.clone(), ctx)),
        ])
    }

    /// Runs the build.
    ///
    /// Returns `None` if no configured volume was attached.
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

        execute(EBS_VOLUME_BUILDER_ID, steps, cancel, &state).await?;

        let volumes = state.get_ok(EBS_VOLUMES).unwrap_or_default();
        if volumes.values().all(Vec::is_empty) {
            return Ok(None);
        }
        let artifact = Artifact::volumes(
            EBS_VOLUME_BUILDER_ID,
            volumes,
            state.get_ok(EBS_SNAPSHOTS).unwrap_or_default(),
            services.cloud(),
        )
        .with_state_data(state.get_ok(GENERATED_DATA).unwrap_or_default());
        services
            .redacted_ui(&self.config.access)
            .say(&format!("Created volumes: {artifact}"));
        Ok(Some(artifact))
    }
}
