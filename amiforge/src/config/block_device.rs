//! Block device settings for launch and registration.

use super::validate::validate_kms_key;
use crate::cloud::{BlockDeviceMapping, EbsBlockDevice, Tags};
use crate::errors::ConfigErrors;
use serde::{Deserialize, Serialize};

/// One block device attached at launch or registered with the AMI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockDevice {
    /// Device name (e.g. `/dev/sdb`).
    pub device_name: String,
    /// Volume type.
    pub volume_type: String,
    /// Size in GiB; `0` keeps the snapshot's size.
    pub volume_size: i64,
    /// Provisioned IOPS.
    pub iops: i64,
    /// Provisioned throughput in MiB/s.
    pub throughput: i64,
    /// Encrypt the volume.
    pub encrypted: Option<bool>,
    /// KMS key for encryption.
    pub kms_key_id: String,
    /// Snapshot to create the volume from.
    pub snapshot_id: String,
    /// Ephemeral virtual name.
    pub virtual_name: String,
    /// Suppress the device.
    pub no_device: bool,
    /// Delete on instance termination.
    pub delete_on_termination: bool,
    /// Tags for the volume (volume builder).
    pub tags: Tags,
    /// Snapshot this volume after provisioning (volume builder).
    pub snapshot_volume: bool,
    /// Description of that snapshot.
    pub snapshot_description: String,
    /// Tags for that snapshot.
    pub snapshot_tags: Tags,
}

fn non_zero(value: i64) -> Option<i64> {
    (value != 0).then_some(value)
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl BlockDevice {
    /// Validates the device.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn prepare(&self) -> Result<(), ConfigErrors> {
        let mut errs = ConfigErrors::new();

        if self.device_name.is_empty() {
            errs.push("the device_name of a block device must be specified");
        }
        if self.volume_type == "gp2" && self.iops != 0 {
            errs.push(format!(
                "{}: iops may not be specified for a gp2 volume",
                self.device_name
            ));
        }
        if self.iops < 0 || self.volume_size < 0 || self.throughput < 0 {
            errs.push(format!(
                "{}: iops, volume_size and throughput must not be negative",
                self.device_name
            ));
        }
        if self.throughput != 0 && self.volume_type != "gp3" {
            errs.push(format!(
                "{}: throughput may only be set for gp3 volumes",
                self.device_name
            ));
        }
        if !self.kms_key_id.is_empty() {
            if self.encrypted != Some(true) {
                errs.push(format!(
                    "{}: kms_key_id requires encrypted to be true",
                    self.device_name
                ));
            }
            if !validate_kms_key(&self.kms_key_id) {
                errs.push(format!(
                    "{}: {:?} is not a valid KMS key id",
                    self.device_name, self.kms_key_id
                ));
            }
        }
        if !self.snapshot_description.is_empty() && !self.snapshot_volume {
            errs.push(format!(
                "{}: snapshot_description requires snapshot_volume",
                self.device_name
            ));
        }

        errs.into_result()
    }

    /// Converts to a mapping.
    #[must_use]
    pub fn to_mapping(&self) -> BlockDeviceMapping {
        let ebs = (self.virtual_name.is_empty() && !self.no_device).then(|| EbsBlockDevice {
            snapshot_id: non_empty(&self.snapshot_id),
            volume_size: non_zero(self.volume_size),
            volume_type: non_empty(&self.volume_type),
            iops: non_zero(self.iops),
            throughput: non_zero(self.throughput),
            encrypted: self.encrypted,
            kms_key_id: non_empty(&self.kms_key_id),
            delete_on_termination: self.delete_on_termination,
        });

        BlockDeviceMapping {
            device_name: self.device_name.clone(),
            ebs,
            virtual_name: non_empty(&self.virtual_name),
            no_device: self.no_device,
        }
    }
}

/// Validates every device and collects all problems.
///
/// # Errors
///
/// Returns every problem found across `devices`.
pub fn prepare_devices(devices: &[BlockDevice]) -> Result<(), ConfigErrors> {
    let mut errs = ConfigErrors::new();
    for device in devices {
        errs.merge(device.prepare());
    }
    errs.into_result()
}

/// Converts devices to mappings.
#[must_use]
pub fn to_mappings(devices: &[BlockDevice]) -> Vec<BlockDeviceMapping> {
    devices.iter().map(BlockDevice::to_mapping).collect()
}

/// How the root device becomes an AMI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageMethod {
    /// `RegisterImage` from a snapshot of the root volume.
    #[default]
    Register,
    /// `CreateImage` from the stopped instance.
    Create,
}

/// Root device of an AMI registered from a surrogate instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RootBlockDevice {
    /// Device on the surrogate that holds the root file system.
    pub source_device_name: String,
    /// Root device name in the AMI.
    pub device_name: String,
    /// Delete on instance termination.
    pub delete_on_termination: bool,
    /// Provisioned IOPS.
    pub iops: i64,
    /// Volume type.
    pub volume_type: String,
    /// Size in GiB.
    pub volume_size: i64,
    /// `create` or `register`; empty means `register`.
    pub image_method: String,
}

impl RootBlockDevice {
    /// Validates the device and defaults `image_method`.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn prepare(&mut self) -> Result<(), ConfigErrors> {
        let mut errs = ConfigErrors::new();

        if self.source_device_name.is_empty() {
            errs.push("source_device_name for the root_device must be specified");
        }
        if self.device_name.is_empty() {
            errs.push("device_name for the root_device must be specified");
        }
        if self.volume_type == "gp2" && self.iops != 0 {
            errs.push("iops may not be specified for a gp2 volume");
        }
        if self.iops < 0 {
            errs.push("iops must be greater than 0");
        }
        if self.volume_size < 0 {
            errs.push("volume_size must be greater than 0");
        }

        if self.image_method.is_empty() {
            self.image_method = "register".to_string();
        } else if self.method().is_none() {
            errs.push("image_method must be 'create', 'register' or an empty string");
        }

        errs.into_result()
    }

    /// Parsed `image_method`.
    #[must_use]
    pub fn method(&self) -> Option<ImageMethod> {
        match self.image_method.as_str() {
            "" | "register" => Some(ImageMethod::Register),
            "create" => Some(ImageMethod::Create),
            _ => None,
        }
    }

    /// Root mapping for `RegisterImage`, backed by `snapshot_id`.
    #[must_use]
    pub fn to_mapping(&self, snapshot_id: &str) -> BlockDeviceMapping {
        BlockDeviceMapping {
            device_name: self.device_name.clone(),
            ebs: Some(EbsBlockDevice {
                snapshot_id: non_empty(snapshot_id),
                volume_size: non_zero(self.volume_size),
                volume_type: non_empty(&self.volume_type),
                iops: non_zero(self.iops),
                delete_on_termination: self.delete_on_termination,
                ..EbsBlockDevice::default()
            }),
            virtual_name: None,
            no_device: false,
        }
    }
}
