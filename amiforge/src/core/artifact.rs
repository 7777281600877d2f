//! The immutable result of a successful build.

use crate::cloud::{destroy_amis, CloudProvider};
use crate::errors::{AmiforgeError, CloudError};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Builder id of the EBS-backed AMI builder.
pub const EBS_BUILDER_ID: &str = "mitchellh.amazonebs";
/// Builder id of the EBS volume builder.
pub const EBS_VOLUME_BUILDER_ID: &str = "mitchellh.amazon.ebsvolume";
/// Builder id of the image import post-processor.
pub const IMPORT_BUILDER_ID: &str = "packer.post-processor.amazon-import";

/// What a run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactResources {
    /// One AMI per region.
    Amis(BTreeMap<String, String>),
    /// Volumes and their snapshots per region.
    Volumes {
        /// Volume ids per region.
        volumes: BTreeMap<String, Vec<String>>,
        /// Snapshot ids per region.
        snapshots: BTreeMap<String, Vec<String>>,
    },
}

/// The terminal record of a successful run.
///
/// Ownership passes to the caller, who may [`Artifact::destroy`] it.
#[derive(Clone)]
pub struct Artifact {
    builder_id: String,
    resources: ArtifactResources,
    state_data: BTreeMap<String, String>,
    cloud: Arc<dyn CloudProvider>,
}

impl Artifact {
    /// An artifact made of AMIs.
    #[must_use]
    pub fn amis(
        builder_id: impl Into<String>,
        amis: BTreeMap<String, String>,
        cloud: Arc<dyn CloudProvider>,
    ) -> Self {
        Self {
            builder_id: builder_id.into(),
            resources: ArtifactResources::Amis(amis),
            state_data: BTreeMap::new(),
            cloud,
        }
    }

    /// An artifact made of volumes and snapshots.
    #[must_use]
    pub fn volumes(
        builder_id: impl Into<String>,
        volumes: BTreeMap<String, Vec<String>>,
        snapshots: BTreeMap<String, Vec<String>>,
        cloud: Arc<dyn CloudProvider>,
    ) -> Self {
        Self {
            builder_id: builder_id.into(),
            resources: ArtifactResources::Volumes { volumes, snapshots },
            state_data: BTreeMap::new(),
            cloud,
        }
    }

    /// Attaches the generated data exposed to later post-processors.
    #[must_use]
    pub fn with_state_data(mut self, data: BTreeMap<String, String>) -> Self {
        self.state_data = data;
        self
    }

    /// Returns the id of the builder that produced this artifact.
    #[must_use]
    pub fn builder_id(&self) -> &str {
        &self.builder_id
    }

    /// Returns the produced resources.
    #[must_use]
    pub const fn resources(&self) -> &ArtifactResources {
        &self.resources
    }

    /// Returns the AMI per region, empty for volume artifacts.
    #[must_use]
    pub fn ami_ids(&self) -> BTreeMap<String, String> {
        match &self.resources {
            ArtifactResources::Amis(amis) => amis.clone(),
            ArtifactResources::Volumes { .. } => BTreeMap::new(),
        }
    }

    /// Looks up one generated value (e.g. `SourceAMI`).
    #[must_use]
    pub fn state(&self, name: &str) -> Option<&str> {
        self.state_data.get(name).map(String::as_str)
    }

    /// Returns all generated values.
    #[must_use]
    pub const fn state_data(&self) -> &BTreeMap<String, String> {
        &self.state_data
    }

    /// Returns `region:id` pairs, comma separated and sorted by region.
    #[must_use]
    pub fn id(&self) -> String {
        match &self.resources {
            ArtifactResources::Amis(amis) => amis
                .iter()
                .map(|(region, ami)| format!("{region}:{ami}"))
                .collect::<Vec<_>>()
                .join(","),
            ArtifactResources::Volumes { volumes, .. } => volumes
                .iter()
                .flat_map(|(region, ids)| ids.iter().map(move |id| format!("{region}:{id}")))
                .collect::<Vec<_>>()
                .join(","),
        }
    }

    /// Deletes everything this artifact refers to.
    ///
    /// AMIs are deregistered and their snapshots deleted; volumes and their
    /// snapshots are deleted. Every resource is attempted.
    ///
    /// # Errors
    ///
    /// Returns one error listing every failed deletion.
    pub async fn destroy(&self) -> Result<(), AmiforgeError> {
        let mut failures: Vec<CloudError> = Vec::new();

        match &self.resources {
            ArtifactResources::Amis(amis) => {
                for (region, ami) in amis {
                    info!(region = %region, image_id = %ami, "Destroying AMI");
                    let ec2 = self.cloud.ec2(region);
                    if let Err(err) = destroy_amis(ec2.as_ref(), std::slice::from_ref(ami), true).await {
                        failures.push(err);
                    }
                }
            }
            ArtifactResources::Volumes { volumes, snapshots } => {
                for (region, ids) in snapshots {
                    let ec2 = self.cloud.ec2(region);
                    for id in ids {
                        info!(region = %region, snapshot_id = %id, "Deleting snapshot");
                        if let Err(err) = ec2.delete_snapshot(id).await {
                            failures.push(err);
                        }
                    }
                }
                for (region, ids) in volumes {
                    let ec2 = self.cloud.ec2(region);
                    for id in ids {
                        info!(region = %region, volume_id = %id, "Deleting volume");
                        if let Err(err) = ec2.delete_volume(id).await {
                            failures.push(err);
                        }
                    }
                }
            }
        }

        if failures.is_empty() {
            return Ok(());
        }
        for err in &failures {
            warn!(error = %err, "Artifact destroy failure");
        }
        let listed = failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(AmiforgeError::step(format!(
            "{} error(s) while destroying artifact: {listed}",
            failures.len()
        )))
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resources {
            ArtifactResources::Amis(amis) => {
                write!(f, "AMIs were created:")?;
                for (region, ami) in amis {
                    write!(f, "\n{region}: {ami}")?;
                }
                Ok(())
            }
            ArtifactResources::Volumes { volumes, snapshots } => {
                write!(f, "EBS Volumes were created:")?;
                for (region, ids) in volumes {
                    write!(f, "\n{region}: {}", ids.join(", "))?;
                }
                if snapshots.values().any(|s| !s.is_empty()) {
                    write!(f, "\nEBS Snapshots were created:")?;
                    for (region, ids) in snapshots {
                        write!(f, "\n{region}: {}", ids.join(", "))?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("builder_id", &self.builder_id)
            .field("resources", &self.resources)
            .field("state_data", &self.state_data)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{Ec2Api, ImageState};
    use crate::testing::FakeCloud;

    fn regions(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(r, a)| ((*r).to_string(), (*a).to_string()))
            .collect()
    }

    #[test]
    fn test_ami_artifact_id_and_display() {
        let cloud = FakeCloud::new("us-east-1");
        let artifact = Artifact::amis(
            EBS_BUILDER_ID,
            regions(&[("us-west-2", "ami-2"), ("us-east-1", "ami-1")]),
            cloud.provider(),
        );

        assert_eq!(artifact.id(), "us-east-1:ami-1,us-west-2:ami-2");
        assert_eq!(
            artifact.to_string(),
            "AMIs were created:\nus-east-1: ami-1\nus-west-2: ami-2"
        );
        assert_eq!(artifact.builder_id(), "mitchellh.amazonebs");
    }

    #[test]
    fn test_volume_artifact_id() {
        let cloud = FakeCloud::new("us-east-1");
        let mut volumes = BTreeMap::new();
        volumes.insert(
            "us-east-1".to_string(),
            vec!["vol-1".to_string(), "vol-2".to_string()],
        );
        let artifact = Artifact::volumes(
            EBS_VOLUME_BUILDER_ID,
            volumes,
            BTreeMap::new(),
            cloud.provider(),
        );

        assert_eq!(artifact.id(), "us-east-1:vol-1,us-east-1:vol-2");
        assert!(artifact.ami_ids().is_empty());
        assert!(!artifact.to_string().contains("Snapshots"));
    }

    #[test]
    fn test_state_data_lookup() {
        let cloud = FakeCloud::new("us-east-1");
        let artifact = Artifact::amis(EBS_BUILDER_ID, BTreeMap::new(), cloud.provider())
            .with_state_data(regions(&[("SourceAMI", "ami-src")]));
        assert_eq!(artifact.state("SourceAMI"), Some("ami-src"));
        assert_eq!(artifact.state("BuildRegion"), None);
    }

    #[tokio::test]
    async fn test_destroy_deregisters_and_deletes_snapshots() {
        let cloud = FakeCloud::new("us-east-1");
        let (ami, snapshot) = cloud.seed_image("us-east-1", "built", ImageState::Available);

        let artifact = Artifact::amis(
            EBS_BUILDER_ID,
            regions(&[("us-east-1", &ami)]),
            cloud.provider(),
        );
        artifact.destroy().await.unwrap();

        assert!(cloud.image("us-east-1", &ami).is_none());
        assert!(!cloud.snapshot_exists("us-east-1", &snapshot));
    }

    #[tokio::test]
    async fn test_destroy_reports_failures() {
        let cloud = FakeCloud::new("us-east-1");
        let (ami, _) = cloud.seed_image("us-east-1", "built", ImageState::Available);
        cloud.fail_next("DeregisterImage", "UnauthorizedOperation");

        let artifact = Artifact::amis(
            EBS_BUILDER_ID,
            regions(&[("us-east-1", &ami)]),
            cloud.provider(),
        );
        let err = artifact.destroy().await.unwrap_err();
        assert!(err.to_string().contains("UnauthorizedOperation"));

        let ec2 = cloud.provider().ec2("us-east-1");
        assert_eq!(ec2.region(), "us-east-1");
    }
}
