//! Settings of the image-import post-processor.

use super::access::AccessConfig;
use super::attributes::ImageAttributes;
use super::template::RenderContext;
use super::validate::{imds_support_error, validate_kms_key};
use crate::cloud::{ImageAttributeChange, ImportImageRequest, Tags};
use crate::errors::ConfigErrors;
use crate::pipeline::PollingConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Disk formats the import service accepts.
pub const IMPORT_FORMATS: [&str; 5] = ["ova", "raw", "vmdk", "vhd", "vhdx"];

const BOOT_MODES: [&str; 2] = ["legacy-bios", "uefi"];

/// Settings of the image-import post-processor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Credentials and region.
    #[serde(flatten)]
    pub access: AccessConfig,
    /// Bucket the disk image is uploaded to.
    pub s3_bucket_name: String,
    /// Object key; a template rendered just before upload.
    pub s3_key_name: String,
    /// `AES256` or `aws:kms`.
    pub s3_encryption: String,
    /// KMS key for `aws:kms` object encryption.
    pub s3_encryption_key: String,
    /// Keep the uploaded object after import.
    pub skip_clean: bool,
    /// Tags for the imported AMI and its snapshots.
    pub tags: Tags,
    /// Rename the imported AMI to this name.
    pub ami_name: String,
    /// Description applied after import.
    pub ami_description: String,
    /// Accounts granted launch permission.
    pub ami_users: Vec<String>,
    /// Groups granted launch permission.
    pub ami_groups: Vec<String>,
    /// Organizations granted launch permission.
    pub ami_org_arns: Vec<String>,
    /// Organizational units granted launch permission.
    pub ami_ou_arns: Vec<String>,
    /// Encrypt the imported image.
    pub ami_encrypt: bool,
    /// KMS key for the imported image.
    pub ami_kms_key: String,
    /// `v2.0` to require IMDSv2.
    pub imds_support: String,
    /// `AWS` or `BYOL`.
    pub license_type: String,
    /// Service role used by the import job.
    pub role_name: String,
    /// Disk format of the uploaded file.
    pub format: String,
    /// `x86_64` or `arm64`.
    pub architecture: String,
    /// `legacy-bios` or `uefi`.
    pub boot_mode: String,
    /// `linux` or `windows`.
    pub platform: String,
    /// Waiter overrides.
    pub aws_polling: PollingConfig,
}

impl ImportConfig {
    /// Creates a config uploading to `bucket` in `region`.
    #[must_use]
    pub fn new(region: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            access: AccessConfig::new(region),
            s3_bucket_name: bucket.into(),
            ..Self::default()
        }
    }

    /// Applies defaults and validates the block.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn prepare(&mut self) -> Result<(), ConfigErrors> {
        let mut errs = ConfigErrors::new();

        if self.format.is_empty() {
            self.format = "ova".to_string();
        }
        if self.s3_key_name.is_empty() {
            self.s3_key_name = format!("packer-import-{{{{timestamp}}}}.{}", self.format);
        }
        if self.architecture.is_empty() {
            self.architecture = "x86_64".to_string();
        }
        if self.boot_mode.is_empty() {
            self.boot_mode = if self.architecture == "arm64" {
                "uefi".to_string()
            } else {
                "legacy-bios".to_string()
            };
        }

        if let Err(err) = RenderContext::new().validate(&self.s3_key_name) {
            errs.push(format!("error parsing s3_key_name template: {err}"));
        }

        errs.merge(self.access.prepare());

        if self.s3_bucket_name.is_empty() {
            errs.push("s3_bucket_name must be set");
        }

        if !IMPORT_FORMATS.contains(&self.format.as_str()) {
            errs.push(format!(
                "invalid format '{}'. Only 'ova', 'raw', 'vhd', 'vhdx', or 'vmdk' are allowed",
                self.format
            ));
        }

        match self.platform.as_str() {
            "linux" | "windows" => {}
            "" if self.boot_mode == "uefi" => errs.push(
                "invalid platform '', 'platform' must be set for 'uefi' image imports",
            ),
            "" => {}
            other => errs.push(format!(
                "invalid platform '{other}'. Only 'linux' and 'windows' are allowed"
            )),
        }

        if !matches!(self.s3_encryption.as_str(), "" | "AES256" | "aws:kms") {
            errs.push(format!(
                "invalid s3 encryption format '{}'. Only 'AES256' and 'aws:kms' are allowed",
                self.s3_encryption
            ));
        }

        if !BOOT_MODES.contains(&self.boot_mode.as_str()) {
            errs.push(format!(
                "invalid boot mode '{}'. Only 'uefi' and 'legacy-bios' are allowed",
                self.boot_mode
            ));
        }
        if self.architecture == "arm64" && self.boot_mode != "uefi" {
            errs.push(format!(
                "invalid boot mode '{}' for 'arm64' architecture",
                self.boot_mode
            ));
        }

        if let Some(err) = imds_support_error(&self.imds_support) {
            errs.push(err);
        }

        if !self.ami_kms_key.is_empty() && !validate_kms_key(&self.ami_kms_key) {
            errs.push(format!("{:?} is not a valid KMS key id", self.ami_kms_key));
        }

        errs.into_result()
    }

    /// True if the uploaded object should be encrypted with a KMS key.
    #[must_use]
    pub fn upload_kms_key(&self) -> Option<String> {
        (self.s3_encryption == "aws:kms" && !self.s3_encryption_key.is_empty())
            .then(|| self.s3_encryption_key.clone())
    }

    /// The import request for an object at `key`.
    #[must_use]
    pub fn import_request(&self, key: &str) -> ImportImageRequest {
        ImportImageRequest {
            description: String::new(),
            format: self.format.clone(),
            bucket: self.s3_bucket_name.clone(),
            key: key.to_string(),
            role_name: (!self.role_name.is_empty()).then(|| self.role_name.clone()),
            license_type: (!self.license_type.is_empty()).then(|| self.license_type.clone()),
            platform: (!self.platform.is_empty()).then(|| self.platform.clone()),
            boot_mode: Some(self.boot_mode.clone()),
            architecture: self.architecture.clone(),
            encrypted: self.ami_encrypt,
            kms_key_id: (self.ami_encrypt && !self.ami_kms_key.is_empty())
                .then(|| self.ami_kms_key.clone()),
            tags: Tags::new(),
        }
    }

    /// Named attribute requests for the imported image.
    #[must_use]
    pub fn modifications(&self) -> BTreeMap<&'static str, ImageAttributeChange> {
        ImageAttributes {
            description: &self.ami_description,
            users: &self.ami_users,
            groups: &self.ami_groups,
            org_arns: &self.ami_org_arns,
            ou_arns: &self.ami_ou_arns,
            imds_support: &self.imds_support,
            product_codes: &[],
        }
        .modifications()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_applied() {
        let mut config = ImportConfig::new("us-east-1", "images");
        config.prepare().unwrap();

        assert_eq!(config.format, "ova");
        assert_eq!(config.s3_key_name, "packer-import-{{timestamp}}.ova");
        assert_eq!(config.architecture, "x86_64");
        assert_eq!(config.boot_mode, "legacy-bios");
    }

    #[test]
    fn test_arm64_defaults_to_uefi_and_needs_platform() {
        let mut config = ImportConfig::new("us-east-1", "images");
        config.architecture = "arm64".to_string();
        config.format = "raw".to_string();

        let errs = config.prepare().unwrap_err();
        assert_eq!(config.boot_mode, "uefi");
        assert_eq!(config.s3_key_name, "packer-import-{{timestamp}}.raw");
        assert!(errs.contains("'platform' must be set for 'uefi'"));

        config.platform = "linux".to_string();
        config.prepare().unwrap();
    }

    #[test]
    fn test_all_errors_collected() {
        let mut config = ImportConfig {
            format: "iso".to_string(),
            platform: "bsd".to_string(),
            s3_encryption: "rot13".to_string(),
            boot_mode: "bios".to_string(),
            imds_support: "v1".to_string(),
            ami_kms_key: "not-a-key".to_string(),
            ..ImportConfig::default()
        };

        let errs = config.prepare().unwrap_err();
        assert!(errs.contains("region must be specified"));
        assert!(errs.contains("s3_bucket_name must be set"));
        assert!(errs.contains("invalid format 'iso'"));
        assert!(errs.contains("invalid platform 'bsd'"));
        assert!(errs.contains("invalid s3 encryption format 'rot13'"));
        assert!(errs.contains("invalid boot mode 'bios'"));
        assert!(errs.contains("imds_support"));
        assert!(errs.contains("not a valid KMS key id"));
        assert_eq!(errs.len(), 8);
    }

    #[test]
    fn test_bad_key_template_rejected() {
        let mut config = ImportConfig::new("us-east-1", "images");
        config.s3_key_name = "disk-{{timestamp".to_string();
        assert!(config.prepare().unwrap_err().contains("s3_key_name template"));
    }

    #[test]
    fn test_import_request_only_carries_key_when_encrypting() {
        let mut config = ImportConfig::new("us-east-1", "images");
        config.ami_kms_key = "alias/images".to_string();
        config.role_name = "vmimport".to_string();
        config.prepare().unwrap();

        let request = config.import_request("disk.ova");
        assert_eq!(request.kms_key_id, None);
        assert_eq!(request.role_name.as_deref(), Some("vmimport"));
        assert_eq!(request.key, "disk.ova");

        config.ami_encrypt = true;
        assert_eq!(
            config.import_request("disk.ova").kms_key_id.as_deref(),
            Some("alias/images")
        );
    }

    #[test]
    fn test_upload_key_only_for_kms() {
        let mut config = ImportConfig::new("us-east-1", "images");
        config.s3_encryption = "AES256".to_string();
        config.s3_encryption_key = "alias/objects".to_string();
        assert_eq!(config.upload_kms_key(), None);

        config.s3_encryption = "aws:kms".to_string();
        assert_eq!(config.upload_kms_key().as_deref(), Some("alias/objects"));
    }
}
