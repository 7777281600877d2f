//! Settings of the temporary instance a build launches.

use super::validate::is_cidr;
use crate::cloud::{Filter, ImageQuery, Tags};
use crate::errors::ConfigErrors;
use crate::pipeline::PollingConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 300;

/// How the build talks to the instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunicatorType {
    /// SSH (port 22).
    #[default]
    Ssh,
    /// WinRM (port 5985).
    Winrm,
    /// No connection; provisioning is skipped.
    None,
}

/// Which instance address the communicator connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshInterface {
    /// Public IPv4 address.
    PublicIp,
    /// Private IPv4 address.
    PrivateIp,
    /// Public DNS name.
    PublicDns,
    /// Private DNS name.
    PrivateDns,
    /// A local port forwarded through Session Manager.
    SessionManager,
}

/// Communicator settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicatorConfig {
    /// Communicator kind.
    #[serde(rename = "type")]
    pub kind: CommunicatorType,
    /// Remote port; `0` uses the kind's default.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Existing key pair to launch with.
    pub keypair_name: String,
    /// Private key for `keypair_name`.
    pub private_key_file: String,
    /// Address selection; `None` prefers the public address.
    pub interface: Option<SshInterface>,
    /// Fixed host, bypassing address selection.
    pub host: String,
    /// Seconds to keep trying to connect.
    pub timeout_seconds: u64,
    /// Name for a temporary key pair; generated when empty.
    pub temporary_key_pair_name: String,
}

impl CommunicatorConfig {
    /// Effective remote port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        match (self.port, self.kind) {
            (0, CommunicatorType::Winrm) => 5985,
            (0, _) => 22,
            (port, _) => port,
        }
    }

    /// Effective connect timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        if self.timeout_seconds == 0 {
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
        } else {
            Duration::from_secs(self.timeout_seconds)
        }
    }

    /// True if a temporary key pair must be created.
    #[must_use]
    pub fn needs_temporary_key_pair(&self) -> bool {
        self.kind == CommunicatorType::Ssh
            && self.keypair_name.is_empty()
            && self.private_key_file.is_empty()
    }

    fn prepare(&mut self, errs: &mut ConfigErrors) {
        if self.kind == CommunicatorType::Ssh && self.username.is_empty() {
            errs.push("communicator username must be specified for ssh");
        }
        if !self.keypair_name.is_empty() && self.private_key_file.is_empty() {
            errs.push("private_key_file must be specified when keypair_name is set");
        }
        if self.timeout_seconds == 0 {
            self.timeout_seconds = DEFAULT_CONNECT_TIMEOUT_SECS;
        }
    }
}

/// Source image lookup by filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmiFilter {
    /// Describe filters (`name`, `architecture`, ...).
    pub filters: BTreeMap<String, String>,
    /// Owner ids or aliases.
    pub owners: Vec<String>,
    /// Pick the newest match instead of failing on several.
    pub most_recent: bool,
}

impl AmiFilter {
    /// True if no filter is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty() && self.owners.is_empty()
    }

    /// Converts to a describe query.
    #[must_use]
    pub fn to_query(&self) -> ImageQuery {
        ImageQuery {
            image_ids: Vec::new(),
            owners: self.owners.clone(),
            filters: to_filters(&self.filters),
        }
    }
}

/// Subnet lookup by filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubnetFilter {
    /// Describe filters.
    pub filters: BTreeMap<String, String>,
    /// Pick the subnet with the most free addresses.
    pub most_free: bool,
}

/// Security group lookup by filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityGroupFilter {
    /// Describe filters.
    pub filters: BTreeMap<String, String>,
}

/// Instance placement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Placement {
    /// `default`, `dedicated` or `host`.
    pub tenancy: String,
    /// Host resource group for `host` tenancy.
    pub host_resource_group_arn: String,
}

/// Converts a filter map into describe filters.
#[must_use]
pub fn to_filters(map: &BTreeMap<String, String>) -> Vec<Filter> {
    map.iter().map(|(k, v)| Filter::new(k, v)).collect()
}

/// Settings of the temporary instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Source image id.
    pub source_ami: String,
    /// Source image lookup.
    pub source_ami_filter: AmiFilter,
    /// Instance type.
    pub instance_type: String,
    /// Spot price; empty or `0` launches on-demand, `auto` lets the service decide.
    pub spot_price: String,
    /// Alternative spot instance types.
    pub spot_instance_types: Vec<String>,
    /// Tags for the spot request.
    pub spot_tags: Tags,
    /// Tags for the instance.
    pub run_tags: Tags,
    /// Tags for volumes created at launch.
    pub run_volume_tags: Tags,
    /// Legacy top-level tenancy.
    pub tenancy: String,
    /// Placement settings.
    pub placement: Placement,
    /// Subnet to launch into.
    pub subnet_id: String,
    /// Subnet lookup.
    pub subnet_filter: SubnetFilter,
    /// VPC of the subnet.
    pub vpc_id: String,
    /// Availability zone.
    pub availability_zone: String,
    /// Existing security groups.
    pub security_group_ids: Vec<String>,
    /// Security group lookup.
    pub security_group_filter: SecurityGroupFilter,
    /// CIDRs allowed into a temporary security group.
    pub temporary_sg_source_cidrs: Vec<String>,
    /// Associate a public address.
    pub associate_public_ip_address: Option<bool>,
    /// Existing instance profile.
    pub iam_instance_profile: String,
    /// Policy for a temporary instance profile.
    pub temporary_iam_instance_profile_policy_document: Option<serde_json::Value>,
    /// Skip checking that `iam_instance_profile` exists.
    pub skip_profile_validation: bool,
    /// User data.
    pub user_data: String,
    /// Launch EBS-optimized.
    pub ebs_optimized: bool,
    /// Leave the instance running before imaging.
    pub disable_stop_instance: bool,
    /// `stop` or `terminate`.
    pub shutdown_behavior: String,
    /// Communicator settings.
    pub communicator: CommunicatorConfig,
    /// Local port for the Session Manager tunnel; `0` picks one.
    pub session_manager_port: u16,
    /// Waiter overrides.
    pub aws_polling: PollingConfig,
}

impl RunConfig {
    /// True if the instance is launched through a spot request.
    #[must_use]
    pub fn is_spot_instance(&self) -> bool {
        !self.spot_price.is_empty() && self.spot_price != "0"
    }

    /// Tenancy from the first non-empty of `placement.tenancy`, then `tenancy`.
    #[must_use]
    pub fn tenancy(&self) -> Option<String> {
        [&self.placement.tenancy, &self.tenancy]
            .into_iter()
            .find(|t| !t.is_empty())
            .cloned()
    }

    /// True if the communicator connects through Session Manager.
    #[must_use]
    pub fn ssm_agent_enabled(&self) -> bool {
        self.communicator.interface == Some(SshInterface::SessionManager)
    }

    /// Normalises and validates the block.
    ///
    /// # Errors
    ///
    /// Returns every problem found.
    pub fn prepare(&mut self) -> Result<(), ConfigErrors> {
        let mut errs = ConfigErrors::new();

        if self.source_ami.is_empty() && self.source_ami_filter.is_empty() {
            errs.push("a source_ami or source_ami_filter must be specified");
        }
        if self.source_ami_filter.owners.is_empty() && !self.source_ami_filter.filters.is_empty() {
            errs.push("for security reasons, source_ami_filter must declare owners");
        }

        let spot = self.is_spot_instance();
        if !self.spot_instance_types.is_empty() {
            if !spot {
                errs.push("spot_instance_types requires spot_price to be set");
            }
            if !self.instance_type.is_empty() {
                errs.push("instance_type and spot_instance_types are mutually exclusive");
            }
        } else if self.instance_type.is_empty() {
            errs.push("an instance_type must be specified");
        }

        if spot && self.spot_price != "auto" && self.spot_price.parse::<f64>().is_err() {
            errs.push(format!(
                "spot_price must be \"auto\" or a decimal price, got {:?}",
                self.spot_price
            ));
        }

        for tenancy in [&self.tenancy, &self.placement.tenancy] {
            if !matches!(tenancy.as_str(), "" | "default" | "dedicated" | "host") {
                errs.push(format!(
                    "tenancy {tenancy:?} is invalid; use default, dedicated or host"
                ));
            }
        }
        if !self.tenancy.is_empty()
            && !self.placement.tenancy.is_empty()
            && self.tenancy != self.placement.tenancy
        {
            errs.push("tenancy and placement.tenancy conflict; set only placement.tenancy");
        }

        if !matches!(self.shutdown_behavior.as_str(), "" | "stop" | "terminate") {
            errs.push(format!(
                "shutdown_behavior {:?} is invalid; use stop or terminate",
                self.shutdown_behavior
            ));
        }

        for cidr in &self.temporary_sg_source_cidrs {
            if !is_cidr(cidr) {
                errs.push(format!("temporary_sg_source_cidrs entry {cidr:?} is not a valid CIDR"));
            }
        }

        if !self.iam_instance_profile.is_empty()
            && self.temporary_iam_instance_profile_policy_document.is_some()
        {
            errs.push(
                "iam_instance_profile and temporary_iam_instance_profile_policy_document are mutually exclusive",
            );
        }
        if self.ssm_agent_enabled()
            && self.iam_instance_profile.is_empty()
            && self.temporary_iam_instance_profile_policy_document.is_none()
        {
            errs.push(
                "the session_manager interface requires iam_instance_profile or \
                 temporary_iam_instance_profile_policy_document",
            );
        }

        self.communicator.prepare(&mut errs);
        errs.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> RunConfig {
        serde_json::from_value(json!({
            "source_ami": "ami-source",
            "instance_type": "t3.micro",
            "communicator": { "username": "ec2-user" }
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_config() {
        let mut c = valid();
        c.prepare().unwrap();
        assert_eq!(c.communicator.timeout(), Duration::from_secs(300));
        assert_eq!(c.communicator.port(), 22);
        assert!(c.communicator.needs_temporary_key_pair());
    }

    #[test]
    fn test_is_spot_instance() {
        let mut c = valid();
        assert!(!c.is_spot_instance());
        c.spot_price = "0".to_string();
        assert!(!c.is_spot_instance());
        c.spot_price = "auto".to_string();
        assert!(c.is_spot_instance());
        c.spot_price = "0.05".to_string();
        assert!(c.is_spot_instance());
    }

    #[test]
    fn test_tenancy_first_non_empty() {
        let mut c = valid();
        assert_eq!(c.tenancy(), None);
        c.tenancy = "dedicated".to_string();
        assert_eq!(c.tenancy().as_deref(), Some("dedicated"));
        c.placement.tenancy = "host".to_string();
        assert_eq!(c.tenancy().as_deref(), Some("host"));
    }

    #[test]
    fn test_errors_are_collected() {
        let mut c = RunConfig {
            spot_price: "cheap".to_string(),
            shutdown_behavior: "hibernate".to_string(),
            temporary_sg_source_cidrs: vec!["nope".to_string()],
            ..RunConfig::default()
        };
        let errs = c.prepare().unwrap_err();
        assert!(errs.contains("source_ami"));
        assert!(errs.contains("instance_type"));
        assert!(errs.contains("spot_price"));
        assert!(errs.contains("shutdown_behavior"));
        assert!(errs.contains("not a valid CIDR"));
        assert!(errs.contains("username"));
    }

    #[test]
    fn test_spot_instance_types() {
        let mut c = valid();
        c.instance_type.clear();
        c.spot_instance_types = vec!["t3.micro".to_string(), "t3a.micro".to_string()];
        assert!(c.prepare().unwrap_err().contains("requires spot_price"));

        let mut c = valid();
        c.instance_type.clear();
        c.spot_price = "auto".to_string();
        c.spot_instance_types = vec!["t3.micro".to_string()];
        assert!(c.prepare().is_ok());
    }

    #[test]
    fn test_session_manager_requires_profile() {
        let mut c = valid();
        c.communicator.interface = Some(SshInterface::SessionManager);
        assert!(c.prepare().unwrap_err().contains("session_manager"));

        c.iam_instance_profile = "ssm-profile".to_string();
        assert!(c.prepare().is_ok());
    }

    #[test]
    fn test_filter_requires_owners() {
        let mut c = valid();
        c.source_ami.clear();
        c.source_ami_filter
            .filters
            .insert("name".to_string(), "ubuntu/*".to_string());
        assert!(c.prepare().unwrap_err().contains("owners"));
    }

    #[test]
    fn test_winrm_default_port() {
        let comm = CommunicatorConfig {
            kind: CommunicatorType::Winrm,
            ..CommunicatorConfig::default()
        };
        assert_eq!(comm.port(), 5985);
        assert!(!comm.needs_temporary_key_pair());
    }
}
