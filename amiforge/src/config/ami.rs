//! Settings of the AMI a build produces.

use super::attributes::ImageAttributes;
use super::validate::{ami_name_errors, imds_support_error, validate_kms_key};
use crate::cloud::{ImageAttributeChange, Tags};
use crate::errors::ConfigErrors;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

/// Deregistration protection for the finished AMI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeregistrationProtection {
    /// Enable protection.
    pub enabled: bool,
    /// Keep protection for 24h after it is disabled. Implies `enabled`.
    pub with_cooldown: bool,
}

/// Settings of the AMI a build produces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmiConfig {
    /// Name of the AMI; may be a template.
    pub ami_name: String,
    /// Description of the AMI; may be a template.
    pub ami_description: String,
    /// `hvm` or `paravirtual` when registering.
    pub ami_virtualization_type: String,
    /// Accounts granted launch permission.
    pub ami_users: Vec<String>,
    /// Groups granted launch permission (`all` makes it public).
    pub ami_groups: Vec<String>,
    /// Organizations granted launch permission.
    pub ami_org_arns: Vec<String>,
    /// Organizational units granted launch permission.
    pub ami_ou_arns: Vec<String>,
    /// Product codes to attach.
    pub ami_product_codes: Vec<String>,
    /// Regions to copy the AMI to.
    pub ami_regions: Vec<String>,
    /// Skip checking that `ami_regions` exist.
    pub skip_region_validation: bool,
    /// Tags for the AMI and its snapshots.
    pub tags: Tags,
    /// Enable ENA on the AMI.
    pub ena_support: Option<bool>,
    /// Enable SR-IOV on the AMI.
    pub sriov_support: bool,
    /// Deregister an existing AMI with the same name first.
    pub force_deregister: bool,
    /// Also delete that AMI's snapshots.
    pub force_delete_snapshot: bool,
    /// Encrypt the boot volume of the AMI.
    pub encrypt_boot: Option<bool>,
    /// KMS key for the build region.
    pub kms_key_id: String,
    /// KMS key per copy region.
    pub region_kms_key_ids: BTreeMap<String, String>,
    /// Do not keep the AMI in the build region.
    pub skip_save_build_region: bool,
    /// `v2.0` to require IMDSv2.
    pub imds_support: String,
    /// RFC3339 deprecation time.
    pub deprecate_at: String,
    /// Accounts granted create-volume permission on snapshots.
    pub snapshot_users: Vec<String>,
    /// Groups granted create-volume permission on snapshots.
    pub snapshot_groups: Vec<String>,
    /// Tags for the AMI snapshots.
    pub snapshot_tags: Tags,
    /// Deregistration protection.
    pub deregistration_protection: DeregistrationProtection,
    /// Deregister the AMI during cleanup if a later step fails.
    pub rollback_image_on_failure: bool,
}

impl AmiConfig {
    /// Creates a config for an AMI named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            ami_name: name.into(),
            ..Self::default()
        }
    }

    /// Normalises and validates the block.
    ///
    /// `build_region` is removed from `ami_regions` and duplicate regions are
    /// collapsed. Every problem is collected before returning.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn prepare(&mut self, build_region: &str) -> Result<(), ConfigErrors> {
        let mut errs = ConfigErrors::new();

        if self.ami_name.is_empty() {
            errs.push("ami_name must be specified");
        }

        for region in self.region_kms_key_ids.keys() {
            if !self.ami_regions.contains(region) {
                errs.push(format!(
                    "region {region} is in region_kms_key_ids but not in ami_regions"
                ));
            }
        }

        self.prepare_regions(build_region, &mut errs);

        let encrypts = self.encrypt_boot == Some(true);
        let default_key = self.kms_key_id.is_empty() && self.region_kms_key_ids.is_empty();
        let empty_region_key = self.region_kms_key_ids.values().any(String::is_empty);

        let shares_image =
            !self.ami_users.is_empty() || !self.ami_org_arns.is_empty() || !self.ami_ou_arns.is_empty();
        if shares_image {
            if default_key && encrypts {
                errs.push("cannot share AMI encrypted with default KMS key");
            }
            if empty_region_key {
                errs.push("cannot share AMI encrypted with default KMS key for other regions");
            }
        }

        let kms_keys: Vec<&String> = std::iter::once(&self.kms_key_id)
            .chain(self.region_kms_key_ids.values())
            .filter(|k| !k.is_empty())
            .collect();
        if !kms_keys.is_empty() && !encrypts {
            errs.push(
                "if you have set either region_kms_key_ids or kms_key_id, encrypt_boot must also be true",
            );
        }
        for key in kms_keys {
            if !validate_kms_key(key) {
                errs.push(format!("{key:?} is not a valid KMS key id"));
            }
        }

        if !self.snapshot_users.is_empty() {
            if default_key && encrypts {
                errs.push("cannot share snapshot encrypted with default KMS key");
            }
            if empty_region_key {
                errs.push("cannot share snapshot encrypted with default KMS key");
            }
        }

        if !self.ami_name.is_empty() && !self.ami_name.contains("{{") {
            for message in ami_name_errors(&self.ami_name) {
                errs.push(message);
            }
        }

        if let Some(message) = imds_support_error(&self.imds_support) {
            errs.push(message);
        }

        if !self.deprecate_at.is_empty() && self.deprecation_time().is_none() {
            errs.push(format!(
                "deprecate_at is not a valid time: {:?}; expected format YYYY-MM-DDTHH:MM:SSZ",
                self.deprecate_at
            ));
        }

        if self.deregistration_protection.with_cooldown {
            self.deregistration_protection.enabled = true;
        }

        errs.into_result()
    }

    fn prepare_regions(&mut self, build_region: &str, errs: &mut ConfigErrors) {
        if self.ami_regions.is_empty() {
            return;
        }

        let mut seen = HashSet::new();
        let mut regions = Vec::with_capacity(self.ami_regions.len());
        for region in &self.ami_regions {
            if !seen.insert(region.clone()) {
                continue;
            }
            if !self.region_kms_key_ids.is_empty() && !self.region_kms_key_ids.contains_key(region) {
                errs.push(format!(
                    "region {region} is in ami_regions but not in region_kms_key_ids"
                ));
            }
            if region == build_region {
                warn!(
                    region = %region,
                    "Cannot copy AMI to the build region, removing it from ami_regions"
                );
                continue;
            }
            regions.push(region.clone());
        }
        self.ami_regions = regions;
    }

    /// Parsed `deprecate_at`.
    #[must_use]
    pub fn deprecation_time(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.deprecate_at)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// KMS key to use when copying into `region`.
    #[must_use]
    pub fn kms_key_for(&self, region: &str) -> Option<String> {
        self.region_kms_key_ids
            .get(region)
            .or(Some(&self.kms_key_id))
            .filter(|k| !k.is_empty())
            .cloned()
    }

    /// Named attribute requests, with the description already rendered.
    #[must_use]
    pub fn modifications(&self, description: &str) -> BTreeMap<&'static str, ImageAttributeChange> {
        ImageAttributes {
            description,
            users: &self.ami_users,
            groups: &self.ami_groups,
            org_arns: &self.ami_org_arns,
            ou_arns: &self.ami_ou_arns,
            imds_support: &self.imds_support,
            product_codes: &self.ami_product_codes,
        }
        .modifications()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUILD_REGION: &str = "us-east-1";
    const KEY: &str = "12345678-1234-1234-1234-123456789012";

    fn valid() -> AmiConfig {
        AmiConfig::new("my-ami")
    }

    #[test]
    fn test_minimal_config_valid() {
        assert!(valid().prepare(BUILD_REGION).is_ok());
    }

    #[test]
    fn test_name_required() {
        let errs = AmiConfig::default().prepare(BUILD_REGION).unwrap_err();
        assert!(errs.contains("ami_name must be specified"));
    }

    #[test]
    fn test_name_rules_collected() {
        let mut c = AmiConfig::new("a#");
        let errs = c.prepare(BUILD_REGION).unwrap_err();
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn test_templated_name_checked_after_render() {
        let mut c = AmiConfig::new("ami {{timestamp}}");
        assert!(c.prepare(BUILD_REGION).is_ok());
    }

    #[test]
    fn test_build_region_dropped_and_duplicates_collapsed() {
        let mut c = valid();
        c.ami_regions = vec![
            "us-west-2".to_string(),
            BUILD_REGION.to_string(),
            "us-west-2".to_string(),
            "eu-west-1".to_string(),
        ];
        c.prepare(BUILD_REGION).unwrap();
        assert_eq!(c.ami_regions, vec!["us-west-2", "eu-west-1"]);
    }

    #[test]
    fn test_region_kms_map_consistency() {
        let mut c = valid();
        c.encrypt_boot = Some(true);
        c.ami_regions = vec!["us-west-2".to_string()];
        c.region_kms_key_ids.insert("eu-west-1".to_string(), KEY.to_string());

        let errs = c.prepare(BUILD_REGION).unwrap_err();
        assert!(errs.contains("eu-west-1 is in region_kms_key_ids but not in ami_regions"));
        assert!(errs.contains("us-west-2 is in ami_regions but not in region_kms_key_ids"));
    }

    #[test]
    fn test_sharing_with_default_key_rejected() {
        let mut c = valid();
        c.encrypt_boot = Some(true);
        c.ami_users = vec!["111111111111".to_string()];
        c.snapshot_users = vec!["111111111111".to_string()];

        let errs = c.prepare(BUILD_REGION).unwrap_err();
        assert!(errs.contains("cannot share AMI encrypted with default KMS key"));
        assert!(errs.contains("cannot share snapshot encrypted with default KMS key"));
    }

    #[test]
    fn test_kms_requires_encrypt_boot_and_valid_key() {
        let mut c = valid();
        c.kms_key_id = "not-a-key".to_string();

        let errs = c.prepare(BUILD_REGION).unwrap_err();
        assert!(errs.contains("encrypt_boot must also be true"));
        assert!(errs.contains("\"not-a-key\" is not a valid KMS key id"));
    }

    #[test]
    fn test_imds_and_deprecation() {
        let mut c = valid();
        c.imds_support = "v1".to_string();
        c.deprecate_at = "tomorrow".to_string();
        let errs = c.prepare(BUILD_REGION).unwrap_err();
        assert_eq!(errs.len(), 2);

        let mut c = valid();
        c.deprecate_at = "2030-01-01T00:00:00Z".to_string();
        c.prepare(BUILD_REGION).unwrap();
        assert!(c.deprecation_time().is_some());
    }

    #[test]
    fn test_cooldown_implies_enabled() {
        let mut c = valid();
        c.deregistration_protection.with_cooldown = true;
        c.prepare(BUILD_REGION).unwrap();
        assert!(c.deregistration_protection.enabled);
    }

    #[test]
    fn test_kms_key_for_region() {
        let mut c = valid();
        c.kms_key_id = "alias/base".to_string();
        c.region_kms_key_ids
            .insert("us-west-2".to_string(), "alias/west".to_string());
        assert_eq!(c.kms_key_for("us-west-2").as_deref(), Some("alias/west"));
        assert_eq!(c.kms_key_for("eu-west-1").as_deref(), Some("alias/base"));
        assert_eq!(AmiConfig::default().kms_key_for("eu-west-1"), None);
    }

    #[test]
    fn test_deserialize_from_json() {
        let c: AmiConfig = serde_json::from_value(serde_json::json!({
            "ami_name": "web {{timestamp}}",
            "ami_users": ["111111111111"],
            "encrypt_boot": true,
            "deregistration_protection": { "with_cooldown": true }
        }))
        .unwrap();
        assert_eq!(c.encrypt_boot, Some(true));
        assert!(c.deregistration_protection.with_cooldown);
        assert_eq!(c.modifications("").len(), 1);
    }
}
