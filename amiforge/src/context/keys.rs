//! Well-known state-bag keys.
//!
//! Steps communicate only through these keys. A step that publishes a key
//! documents it here; a later step must treat any of them as possibly absent.

use super::StateKey;
use crate::cloud::{CloudProvider, Ec2Api, IamApi, Image, Instance};
use crate::config::RunConfig;
use crate::errors::AmiforgeError;
use crate::observability::Ui;
use crate::pipeline::ResolvedPolling;
use crate::steps::{Communicator, Hook};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Region name to resource ids.
pub type RegionMap<T> = BTreeMap<String, T>;

/// Launch settings of the build.
pub const CONFIG: StateKey<Arc<RunConfig>> = StateKey::new("config");
/// Polling overrides resolved once at the start of the run.
pub const POLLING: StateKey<ResolvedPolling> = StateKey::new("polling");
/// EC2 client for the build region.
pub const EC2: StateKey<Arc<dyn Ec2Api>> = StateKey::new("ec2");
/// IAM client.
pub const IAM: StateKey<Arc<dyn IamApi>> = StateKey::new("iam");
/// Region-aware client factory.
pub const CLOUD: StateKey<Arc<dyn CloudProvider>> = StateKey::new("cloud");
/// Diagnostics stream.
pub const UI: StateKey<Arc<dyn Ui>> = StateKey::new("ui");
/// Provisioning hook.
pub const HOOK: StateKey<Arc<dyn Hook>> = StateKey::new("hook");
/// The build region.
pub const REGION: StateKey<String> = StateKey::new("region");

/// Resolved source image.
pub const SOURCE_IMAGE: StateKey<Image> = StateKey::new("source_image");
/// Resolved VPC.
pub const VPC_ID: StateKey<String> = StateKey::new("vpc_id");
/// Resolved subnet.
pub const SUBNET_ID: StateKey<String> = StateKey::new("subnet_id");
/// Resolved availability zone.
pub const AVAILABILITY_ZONE: StateKey<String> = StateKey::new("availability_zone");
/// Security groups attached to the instance.
pub const SECURITY_GROUP_IDS: StateKey<Vec<String>> = StateKey::new("security_group_ids");
/// Key pair name used to launch.
pub const KEY_PAIR: StateKey<String> = StateKey::new("key_pair");
/// Private key material for the communicator.
pub const PRIVATE_KEY: StateKey<String> = StateKey::new("private_key");
/// Instance profile attached to the instance.
pub const IAM_INSTANCE_PROFILE: StateKey<String> = StateKey::new("iam_instance_profile");

/// The launched instance id.
pub const INSTANCE_ID: StateKey<String> = StateKey::new("instance_id");
/// The launched instance as last described.
pub const INSTANCE: StateKey<Instance> = StateKey::new("instance");
/// The spot request backing the instance.
pub const SPOT_REQUEST_ID: StateKey<String> = StateKey::new("spot_request_id");

/// Connected communicator.
pub const COMMUNICATOR: StateKey<Arc<dyn Communicator>> = StateKey::new("communicator");
/// Host the communicator connects to.
pub const SSH_HOST: StateKey<String> = StateKey::new("ssh_host");
/// Port the communicator connects to.
pub const SSH_PORT: StateKey<u16> = StateKey::new("ssh_port");
/// Values exposed to templates after launch (`BuildRegion`, `SourceAMI`, ...).
pub const GENERATED_DATA: StateKey<BTreeMap<String, String>> = StateKey::new("generated_data");

/// Rendered name of the AMI being built.
pub const AMI_NAME: StateKey<String> = StateKey::new("ami_name");
/// Created AMIs per region.
pub const AMIS: StateKey<RegionMap<String>> = StateKey::new("amis");
/// Snapshots backing created AMIs per region.
pub const SNAPSHOTS: StateKey<RegionMap<Vec<String>>> = StateKey::new("snapshots");
/// Volumes kept by the volume builder per region.
pub const EBS_VOLUMES: StateKey<RegionMap<Vec<String>>> = StateKey::new("ebsvolumes");
/// Snapshots taken by the volume builder per region.
pub const EBS_SNAPSHOTS: StateKey<RegionMap<Vec<String>>> = StateKey::new("ebssnapshots");

/// The fatal error of the run, set at most once.
pub const ERROR: StateKey<AmiforgeError> = StateKey::new("error");
/// Set by the runner when a step halted.
pub const HALTED: StateKey<bool> = StateKey::new("halted");
/// Set by the runner when the run was cancelled.
pub const CANCELLED: StateKey<bool> = StateKey::new("cancelled");
