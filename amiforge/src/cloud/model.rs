//! Plain data types exchanged with the cloud ports.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Resource tags, sorted by key.
pub type Tags = BTreeMap<String, String>;

/// A describe filter (`name=values`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Filter name (e.g. `name`, `vpc-id`, `tag:Env`).
    pub name: String,
    /// Accepted values.
    pub values: Vec<String>,
}

impl Filter {
    /// Creates a single-value filter.
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: vec![value.into()],
        }
    }
}

/// Query for `DescribeImages`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageQuery {
    /// Restrict to these ids.
    pub image_ids: Vec<String>,
    /// Restrict to these owners.
    pub owners: Vec<String>,
    /// Additional filters.
    pub filters: Vec<Filter>,
}

impl ImageQuery {
    /// Queries a set of image ids.
    #[must_use]
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            image_ids: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Queries images by exact name, optionally owned by `self`.
    #[must_use]
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            owners: vec!["self".to_string()],
            filters: vec![Filter::new("name", name)],
            ..Self::default()
        }
    }
}

macro_rules! state_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[doc = $text]
                $variant,
            )+
        }

        impl $name {
            /// Returns the wire name of the state.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

state_enum!(
    /// Lifecycle of an AMI.
    ImageState {
        Pending => "pending",
        Available => "available",
        Failed => "failed",
        Deregistered => "deregistered",
    }
);

state_enum!(
    /// Lifecycle of an EC2 instance.
    InstanceState {
        Pending => "pending",
        Running => "running",
        Stopping => "stopping",
        Stopped => "stopped",
        ShuttingDown => "shutting-down",
        Terminated => "terminated",
    }
);

state_enum!(
    /// Lifecycle of an EBS snapshot.
    SnapshotState {
        Pending => "pending",
        Completed => "completed",
        Error => "error",
    }
);

state_enum!(
    /// Lifecycle of an EBS volume.
    VolumeState {
        Creating => "creating",
        Available => "available",
        InUse => "in-use",
        Deleting => "deleting",
        Deleted => "deleted",
        Error => "error",
    }
);

state_enum!(
    /// Lifecycle of a spot instance request.
    SpotRequestState {
        Open => "open",
        Active => "active",
        Closed => "closed",
        Cancelled => "cancelled",
        Failed => "failed",
    }
);

state_enum!(
    /// Status of an image import task.
    ImportTaskStatus {
        Active => "active",
        Completed => "completed",
        Deleting => "deleting",
        Deleted => "deleted",
    }
);

/// EBS parameters of one block device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EbsBlockDevice {
    /// Snapshot to create the volume from.
    pub snapshot_id: Option<String>,
    /// Size in GiB.
    pub volume_size: Option<i64>,
    /// Volume type (`gp2`, `gp3`, `io1`, ...).
    pub volume_type: Option<String>,
    /// Provisioned IOPS.
    pub iops: Option<i64>,
    /// Provisioned throughput in MiB/s.
    pub throughput: Option<i64>,
    /// Whether the volume is encrypted.
    pub encrypted: Option<bool>,
    /// KMS key used for encryption.
    pub kms_key_id: Option<String>,
    /// Delete the volume when the instance terminates.
    pub delete_on_termination: bool,
}

/// A block device mapping used to launch or register.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    /// Device name (e.g. `/dev/sda1`).
    pub device_name: String,
    /// EBS parameters, absent for ephemeral devices.
    pub ebs: Option<EbsBlockDevice>,
    /// Ephemeral virtual name (e.g. `ephemeral0`).
    pub virtual_name: Option<String>,
    /// Suppress a device included in the source image.
    pub no_device: bool,
}

/// An AMI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Image id (`ami-...`).
    pub id: String,
    /// Image name.
    pub name: String,
    /// Current state.
    pub state: Option<ImageState>,
    /// Reason for a failed state.
    pub state_reason: Option<String>,
    /// Root device type (`ebs` or `instance-store`).
    pub root_device_type: String,
    /// Root device name.
    pub root_device_name: String,
    /// `hvm` or `paravirtual`.
    pub virtualization_type: String,
    /// CPU architecture.
    pub architecture: String,
    /// RFC3339 creation timestamp.
    pub creation_date: String,
    /// Whether ENA is enabled.
    pub ena_support: bool,
    /// Block devices, including the snapshots backing the image.
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    /// Image tags.
    pub tags: Tags,
}

impl Image {
    /// Returns the ids of the EBS snapshots backing this image.
    #[must_use]
    pub fn snapshot_ids(&self) -> Vec<String> {
        self.block_device_mappings
            .iter()
            .filter_map(|m| m.ebs.as_ref().and_then(|e| e.snapshot_id.clone()))
            .collect()
    }

    /// Returns true if the root device is EBS.
    #[must_use]
    pub fn is_ebs_backed(&self) -> bool {
        self.root_device_type == "ebs"
    }
}

/// A volume attached to an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceBlockDevice {
    /// Device name on the instance.
    pub device_name: String,
    /// Attached volume id.
    pub volume_id: String,
}

/// An EC2 instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Instance id (`i-...`).
    pub id: String,
    /// Current state.
    pub state: InstanceState,
    /// Image the instance was launched from.
    pub image_id: String,
    /// Public IPv4 address.
    pub public_ip: Option<String>,
    /// Private IPv4 address.
    pub private_ip: Option<String>,
    /// Public DNS name.
    pub public_dns: Option<String>,
    /// Private DNS name.
    pub private_dns: Option<String>,
    /// Availability zone.
    pub availability_zone: String,
    /// Root device type.
    pub root_device_type: String,
    /// Attached volumes.
    pub block_devices: Vec<InstanceBlockDevice>,
    /// Spot request that launched the instance.
    pub spot_request_id: Option<String>,
}

/// An EBS volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Volume id (`vol-...`).
    pub id: String,
    /// Current state.
    pub state: VolumeState,
    /// Size in GiB.
    pub size: i64,
    /// Attached instance, if any.
    pub instance_id: Option<String>,
    /// Device name on the attached instance.
    pub device_name: Option<String>,
    /// Volume tags.
    pub tags: Tags,
}

/// An EBS snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot id (`snap-...`).
    pub id: String,
    /// Source volume.
    pub volume_id: String,
    /// Current state.
    pub state: SnapshotState,
    /// Error message for a failed snapshot.
    pub state_message: Option<String>,
}

/// A VPC subnet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    /// Subnet id.
    pub id: String,
    /// Owning VPC.
    pub vpc_id: String,
    /// Availability zone.
    pub availability_zone: String,
    /// Free addresses.
    pub available_ip_count: i64,
}

/// A security group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    /// Group id (`sg-...`).
    pub id: String,
    /// Group name.
    pub name: String,
    /// Owning VPC.
    pub vpc_id: String,
}

/// A key pair as returned on creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Key pair name.
    pub name: String,
    /// PEM-encoded private key.
    pub private_key: String,
}

/// A spot instance request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotRequest {
    /// Request id (`sir-...`).
    pub id: String,
    /// Current state.
    pub state: SpotRequestState,
    /// Fulfilled instance, once active.
    pub instance_id: Option<String>,
    /// Status code (e.g. `fulfilled`, `price-too-low`).
    pub status_code: String,
    /// Status message.
    pub status_message: String,
}

/// An image import task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportTask {
    /// Task id (`import-ami-...`).
    pub id: String,
    /// Current status.
    pub status: ImportTaskStatus,
    /// Progress or failure message.
    pub status_message: String,
    /// Resulting image, once completed.
    pub image_id: Option<String>,
}

/// An IAM instance profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceProfile {
    /// Profile name.
    pub name: String,
    /// Profile ARN.
    pub arn: String,
    /// Attached role names.
    pub roles: Vec<String>,
}

/// Parameters for launching one on-demand instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInstancesRequest {
    /// Source image.
    pub image_id: String,
    /// Instance type.
    pub instance_type: String,
    /// Key pair to inject.
    pub key_name: Option<String>,
    /// Security groups to attach.
    pub security_group_ids: Vec<String>,
    /// Subnet to launch into.
    pub subnet_id: Option<String>,
    /// Availability zone when no subnet is given.
    pub availability_zone: Option<String>,
    /// Instance profile name.
    pub iam_instance_profile: Option<String>,
    /// User data, base64 encoding is the binding's concern.
    pub user_data: Option<String>,
    /// EBS-optimized launch.
    pub ebs_optimized: bool,
    /// Placement tenancy.
    pub tenancy: Option<String>,
    /// Host resource group for dedicated hosts.
    pub host_resource_group_arn: Option<String>,
    /// Associate a public address.
    pub associate_public_ip_address: Option<bool>,
    /// Shutdown behavior (`stop` or `terminate`).
    pub shutdown_behavior: Option<String>,
    /// Block devices: root plus launch volumes.
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    /// Tags for the instance.
    pub instance_tags: Tags,
    /// Tags for volumes created at launch, keyed by device name; `""` applies to all.
    pub volume_tags: BTreeMap<String, Tags>,
}

/// Parameters for a one-time spot request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotInstanceRequest {
    /// Launch parameters shared with on-demand.
    pub launch: RunInstancesRequest,
    /// Maximum price; `auto` lets the service choose.
    pub spot_price: String,
    /// Alternative instance types.
    pub instance_types: Vec<String>,
    /// Tags for the spot request.
    pub spot_tags: Tags,
}

/// Parameters for `CreateImage`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateImageRequest {
    /// Instance to capture.
    pub instance_id: String,
    /// Image name.
    pub name: String,
    /// Image description.
    pub description: String,
    /// Overrides for launch and extra devices.
    pub block_device_mappings: Vec<BlockDeviceMapping>,
}

/// Parameters for `RegisterImage` from a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterImageRequest {
    /// Image name.
    pub name: String,
    /// Image description.
    pub description: String,
    /// CPU architecture.
    pub architecture: String,
    /// Root device name.
    pub root_device_name: String,
    /// `hvm` or `paravirtual`.
    pub virtualization_type: String,
    /// Block devices, including the root snapshot.
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    /// Enable ENA.
    pub ena_support: Option<bool>,
    /// Enable SR-IOV (`simple`).
    pub sriov_net_support: Option<String>,
    /// Boot mode.
    pub boot_mode: Option<String>,
    /// IMDS support (`v2.0`).
    pub imds_support: Option<String>,
}

/// Parameters for `CopyImage`, sent to the destination region.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyImageRequest {
    /// Region holding the source image.
    pub source_region: String,
    /// Image to copy.
    pub source_image_id: String,
    /// Name of the copy.
    pub name: String,
    /// Description of the copy.
    pub description: String,
    /// Encrypt the copied snapshots.
    pub encrypted: bool,
    /// KMS key for encryption.
    pub kms_key_id: Option<String>,
}

/// Parameters for `ImportImage`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportImageRequest {
    /// Task description.
    pub description: String,
    /// Disk format.
    pub format: String,
    /// Bucket holding the disk image.
    pub bucket: String,
    /// Object key of the disk image.
    pub key: String,
    /// Service role name, defaults to `vmimport` on the service side.
    pub role_name: Option<String>,
    /// License type (`AWS` or `BYOL`).
    pub license_type: Option<String>,
    /// Operating system platform.
    pub platform: Option<String>,
    /// Boot mode.
    pub boot_mode: Option<String>,
    /// CPU architecture.
    pub architecture: String,
    /// Encrypt the resulting snapshots.
    pub encrypted: bool,
    /// KMS key for encryption.
    pub kms_key_id: Option<String>,
    /// Tags for the import task.
    pub tags: Tags,
}

/// Parameters for an object upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRequest {
    /// Destination bucket.
    pub bucket: String,
    /// Destination key.
    pub key: String,
    /// Local file to upload.
    pub source: PathBuf,
    /// Server-side encryption (`AES256` or `aws:kms`).
    pub server_side_encryption: Option<String>,
    /// KMS key for `aws:kms`.
    pub kms_key_id: Option<String>,
}

/// Principal granted launch permission on an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LaunchPermission {
    /// An account id.
    User(String),
    /// A group (`all` makes the image public).
    Group(String),
    /// An organization ARN.
    OrganizationArn(String),
    /// An organizational unit ARN.
    OrganizationalUnitArn(String),
}

/// One independently applied image attribute change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageAttributeChange {
    /// Replace the description.
    Description(String),
    /// Grant launch permission.
    LaunchPermissionAdd(Vec<LaunchPermission>),
    /// Require IMDSv2 for launched instances.
    ImdsSupport(String),
    /// Attach product codes.
    ProductCodes(Vec<String>),
}

/// One instance attribute change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceAttribute {
    /// Enable or disable ENA.
    EnaSupport(bool),
    /// Set SR-IOV support (`simple`).
    SriovNetSupport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(InstanceState::ShuttingDown.to_string(), "shutting-down");
        assert_eq!(ImageState::Available.as_str(), "available");
        assert_eq!(ImportTaskStatus::Completed.to_string(), "completed");
    }

    #[test]
    fn test_image_snapshot_ids() {
        let image = Image {
            id: "ami-1".to_string(),
            block_device_mappings: vec![
                BlockDeviceMapping {
                    device_name: "/dev/sda1".to_string(),
                    ebs: Some(EbsBlockDevice {
                        snapshot_id: Some("snap-1".to_string()),
                        ..EbsBlockDevice::default()
                    }),
                    ..BlockDeviceMapping::default()
                },
                BlockDeviceMapping {
                    device_name: "/dev/sdb".to_string(),
                    virtual_name: Some("ephemeral0".to_string()),
                    ..BlockDeviceMapping::default()
                },
            ],
            ..Image::default()
        };
        assert_eq!(image.snapshot_ids(), vec!["snap-1".to_string()]);
    }
}
