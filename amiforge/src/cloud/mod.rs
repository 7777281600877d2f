//! Ports to the EC2, S3 and IAM services.
//!
//! The orchestrator never talks to AWS directly. A binding implements these
//! traits; [`crate::testing::FakeCloud`] implements them in memory.

mod model;

pub use model::*;

use crate::errors::CloudError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Result of a remote call.
pub type CloudResult<T> = Result<T, CloudError>;

/// EC2 operations used by the build steps. One client is bound to one region.
#[async_trait]
pub trait Ec2Api: Send + Sync {
    /// Returns the region this client is bound to.
    fn region(&self) -> &str;

    // Images
    /// Describes images matching the query.
    async fn describe_images(&self, query: &ImageQuery) -> CloudResult<Vec<Image>>;
    /// Captures an image from an instance, returning the new image id.
    async fn create_image(&self, request: &CreateImageRequest) -> CloudResult<String>;
    /// Registers an image from snapshots, returning the new image id.
    async fn register_image(&self, request: &RegisterImageRequest) -> CloudResult<String>;
    /// Copies an image into this client's region, returning the new image id.
    async fn copy_image(&self, request: &CopyImageRequest) -> CloudResult<String>;
    /// Deregisters an image.
    async fn deregister_image(&self, image_id: &str) -> CloudResult<()>;
    /// Applies one attribute change to an image.
    async fn modify_image_attribute(
        &self,
        image_id: &str,
        change: &ImageAttributeChange,
    ) -> CloudResult<()>;
    /// Schedules image deprecation.
    async fn enable_image_deprecation(
        &self,
        image_id: &str,
        deprecate_at: DateTime<Utc>,
    ) -> CloudResult<()>;
    /// Protects an image from deregistration.
    async fn enable_image_deregistration_protection(
        &self,
        image_id: &str,
        with_cooldown: bool,
    ) -> CloudResult<()>;

    // Import
    /// Starts an image import, returning the task id.
    async fn import_image(&self, request: &ImportImageRequest) -> CloudResult<String>;
    /// Describes an import task.
    async fn describe_import_image_task(&self, task_id: &str) -> CloudResult<ImportTask>;

    // Instances
    /// Launches one on-demand instance.
    async fn run_instances(&self, request: &RunInstancesRequest) -> CloudResult<Instance>;
    /// Describes an instance.
    async fn describe_instance(&self, instance_id: &str) -> CloudResult<Instance>;
    /// Stops an instance.
    async fn stop_instance(&self, instance_id: &str) -> CloudResult<()>;
    /// Terminates an instance.
    async fn terminate_instance(&self, instance_id: &str) -> CloudResult<()>;
    /// Changes one instance attribute.
    async fn modify_instance_attribute(
        &self,
        instance_id: &str,
        attribute: &InstanceAttribute,
    ) -> CloudResult<()>;

    // Spot
    /// Submits a one-time spot request.
    async fn request_spot_instance(
        &self,
        request: &SpotInstanceRequest,
    ) -> CloudResult<SpotRequest>;
    /// Describes a spot request.
    async fn describe_spot_request(&self, request_id: &str) -> CloudResult<SpotRequest>;
    /// Cancels a spot request.
    async fn cancel_spot_request(&self, request_id: &str) -> CloudResult<()>;

    // Network
    /// Describes subnets matching the filters.
    async fn describe_subnets(&self, filters: &[Filter]) -> CloudResult<Vec<Subnet>>;
    /// Describes security groups matching the filters.
    async fn describe_security_groups(&self, filters: &[Filter]) -> CloudResult<Vec<SecurityGroup>>;
    /// Creates a security group, returning its id.
    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        vpc_id: Option<&str>,
    ) -> CloudResult<String>;
    /// Opens a TCP port to the given CIDRs.
    async fn authorize_ingress(&self, group_id: &str, port: u16, cidrs: &[String])
        -> CloudResult<()>;
    /// Deletes a security group.
    async fn delete_security_group(&self, group_id: &str) -> CloudResult<()>;

    // Key pairs
    /// Creates a key pair.
    async fn create_key_pair(&self, name: &str) -> CloudResult<KeyPair>;
    /// Deletes a key pair.
    async fn delete_key_pair(&self, name: &str) -> CloudResult<()>;

    // Volumes & snapshots
    /// Describes volumes matching the filters.
    async fn describe_volumes(&self, filters: &[Filter]) -> CloudResult<Vec<Volume>>;
    /// Deletes a volume.
    async fn delete_volume(&self, volume_id: &str) -> CloudResult<()>;
    /// Snapshots a volume, returning the snapshot id.
    async fn create_snapshot(&self, volume_id: &str, description: &str) -> CloudResult<String>;
    /// Describes a snapshot.
    async fn describe_snapshot(&self, snapshot_id: &str) -> CloudResult<Snapshot>;
    /// Deletes a snapshot.
    async fn delete_snapshot(&self, snapshot_id: &str) -> CloudResult<()>;
    /// Grants create-volume permission on a snapshot.
    async fn modify_snapshot_create_volume_permission(
        &self,
        snapshot_id: &str,
        users: &[String],
        groups: &[String],
    ) -> CloudResult<()>;

    // Tags
    /// Tags resources.
    async fn create_tags(&self, resource_ids: &[String], tags: &Tags) -> CloudResult<()>;
}

/// S3 operations used by the import post-processor.
#[async_trait]
pub trait S3Api: Send + Sync {
    /// Uploads a local file.
    async fn upload(&self, request: &UploadRequest) -> CloudResult<()>;
    /// Deletes an object.
    async fn delete_object(&self, bucket: &str, key: &str) -> CloudResult<()>;
}

/// IAM operations used to create a temporary instance profile.
#[async_trait]
pub trait IamApi: Send + Sync {
    /// Describes an instance profile.
    async fn get_instance_profile(&self, name: &str) -> CloudResult<InstanceProfile>;
    /// Creates a role trusted by EC2.
    async fn create_role(&self, name: &str, assume_role_policy: &str) -> CloudResult<()>;
    /// Attaches an inline policy to a role.
    async fn put_role_policy(&self, role: &str, policy_name: &str, document: &str)
        -> CloudResult<()>;
    /// Creates an instance profile.
    async fn create_instance_profile(&self, name: &str) -> CloudResult<InstanceProfile>;
    /// Adds a role to an instance profile.
    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> CloudResult<()>;
    /// Removes a role from an instance profile.
    async fn remove_role_from_instance_profile(&self, profile: &str, role: &str)
        -> CloudResult<()>;
    /// Deletes an inline role policy.
    async fn delete_role_policy(&self, role: &str, policy_name: &str) -> CloudResult<()>;
    /// Deletes a role.
    async fn delete_role(&self, name: &str) -> CloudResult<()>;
    /// Deletes an instance profile.
    async fn delete_instance_profile(&self, name: &str) -> CloudResult<()>;
}

/// Hands out region-bound clients.
pub trait CloudProvider: Send + Sync {
    /// Returns the region used when none is given.
    fn default_region(&self) -> String;
    /// Returns an EC2 client for `region`.
    fn ec2(&self, region: &str) -> Arc<dyn Ec2Api>;
    /// Returns an S3 client for `region`.
    fn s3(&self, region: &str) -> Arc<dyn S3Api>;
    /// Returns the IAM client.
    fn iam(&self) -> Arc<dyn IamApi>;
}

/// Deregisters images and optionally deletes the snapshots backing them.
///
/// Images that no longer exist are skipped. Every image is attempted; the
/// first error is returned after all have been tried.
///
/// # Errors
///
/// Returns the first failed describe, deregister or delete call.
pub async fn destroy_amis(
    ec2: &dyn Ec2Api,
    image_ids: &[String],
    delete_snapshots: bool,
) -> CloudResult<()> {
    if image_ids.is_empty() {
        return Ok(());
    }

    let images = ec2.describe_images(&ImageQuery::ids(image_ids.iter().cloned())).await?;
    let mut first_error = None;

    for image in images {
        info!(region = ec2.region(), image_id = %image.id, "Deregistering image");
        if let Err(err) = ec2.deregister_image(&image.id).await {
            warn!(image_id = %image.id, error = %err, "Failed to deregister image");
            first_error.get_or_insert(err);
            continue;
        }

        if !delete_snapshots {
            continue;
        }
        for snapshot_id in image.snapshot_ids() {
            info!(image_id = %image.id, snapshot_id = %snapshot_id, "Deleting snapshot");
            if let Err(err) = ec2.delete_snapshot(&snapshot_id).await {
                warn!(snapshot_id = %snapshot_id, error = %err, "Failed to delete snapshot");
                first_error.get_or_insert(err);
            }
        }
    }

    first_error.map_or(Ok(()), Err)
}
