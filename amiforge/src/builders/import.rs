//! Imports a disk image file as an AMI through S3.
//!
//! Upload, start the import, wait, then optionally rename, tag, modify
//! attributes and delete the uploaded object. Each phase runs only after the
//! previous one succeeded. Nothing is rolled back: a started import task is
//! left for the operator to inspect.

use super::BuildServices;
use crate::cancellation::CancellationToken;
use crate::cloud::{destroy_amis, CopyImageRequest, Ec2Api, ImageQuery, UploadRequest};
use crate::config::{ImportConfig, RenderContext};
use crate::core::{Artifact, IMPORT_BUILDER_ID};
use crate::errors::{AmiforgeError, ConfigErrors};
use crate::observability::Ui;
use crate::pipeline::{RetryConfig, WaitError, WaitOptions, WaiterDefaults};
use crate::steps::{wait_for_image, wait_for_import};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// The image-import post-processor.
#[derive(Debug)]
pub struct ImportPostProcessor {
    config: ImportConfig,
}

struct ImportRun<'a> {
    config: &'a ImportConfig,
    ec2: Arc<dyn Ec2Api>,
    ui: Arc<dyn Ui>,
    cancel: &'a CancellationToken,
    key: String,
}

impl ImportPostProcessor {
    /// Validates `config` and returns a post-processor for it.
    ///
    /// # Errors
    ///
    /// Returns every configuration problem before any remote call is made.
    pub fn new(mut config: ImportConfig) -> Result<Self, ConfigErrors> {
        config.prepare()?;
        Ok(Self { config })
    }

    /// The validated configuration.
    #[must_use]
    pub const fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// The first file with the configured format's extension.
    fn source<'f>(&self, files: &'f [PathBuf]) -> Result<&'f Path, AmiforgeError> {
        let suffix = format!(".{}", self.config.format);
        files
            .iter()
            .find(|f| f.to_string_lossy().ends_with(&suffix))
            .map(PathBuf::as_path)
            .ok_or_else(|| {
                AmiforgeError::step(format!(
                    "no {} image file found in artifact from builder",
                    self.config.format
                ))
            })
    }

    /// Imports the first matching file of `files` and returns the AMI.
    ///
    /// `generated_data` from the previous builder is available to the
    /// `s3_key_name` template.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error naming the bucket, task or image involved
    /// in the phase that failed, or [`AmiforgeError::Cancelled`] if `cancel`
    /// fired while a phase was retrying or waiting.
    pub async fn run(
        &self,
        services: &BuildServices,
        cancel: &CancellationToken,
        files: &[PathBuf],
        generated_data: &BTreeMap<String, String>,
    ) -> Result<Artifact, AmiforgeError> {
        match self.import(services, cancel, files, generated_data).await {
            Err(err) if !err.is_cancelled() && cancel.is_cancelled() => {
                debug!(error = %err, "Import interrupted");
                Err(AmiforgeError::Cancelled(cancel.reason().unwrap_or_default()))
            }
            result => result,
        }
    }

    async fn import(
        &self,
        services: &BuildServices,
        cancel: &CancellationToken,
        files: &[PathBuf],
        generated_data: &BTreeMap<String, String>,
    ) -> Result<Artifact, AmiforgeError> {
        let config = &self.config;
        let region = config.access.region.clone();
        let ctx = RenderContext::new().with_all_data(generated_data);

        let key = ctx
            .render(&config.s3_key_name)
            .map_err(|err| AmiforgeError::step(format!("error rendering s3_key_name template: {err}")))?;
        debug!(key = %key, "Rendered s3_key_name");

        let cloud = services.cloud();
        let run = ImportRun {
            config,
            ec2: cloud.ec2(&region),
            ui: services.redacted_ui(&config.access),
            cancel,
            key,
        };
        let polling = services.resolve_polling(&config.aws_polling);

        let source = self.source(files)?;
        run.upload(services, source).await?;
        let task_id = run.start_import(&ctx).await?;
        let mut image_id = run
            .wait_for_task(&task_id, polling.for_waiter(WaiterDefaults::IMAGE_IMPORT))
            .await?;

        if !config.ami_name.is_empty() {
            image_id = run
                .rename(&region, &image_id, polling.for_waiter(WaiterDefaults::STANDARD))
                .await?;
        }
        if !config.tags.is_empty() {
            run.tag(&image_id).await?;
        }
        run.modify_attributes(&image_id).await?;

        info!(region = %region, image_id = %image_id, "Imported AMI");
        let artifact = Artifact::amis(
            IMPORT_BUILDER_ID,
            BTreeMap::from([(region.clone(), image_id)]),
            cloud.clone(),
        );

        if !config.skip_clean {
            run.delete_source(services).await?;
        }
        Ok(artifact)
    }
}

impl ImportRun<'_> {
    fn location(&self) -> String {
        format!("s3://{}/{}", self.config.s3_bucket_name, self.key)
    }

    async fn upload(&self, services: &BuildServices, source: &Path) -> Result<(), AmiforgeError> {
        let config = self.config;
        if config.s3_encryption == "AES256" && !config.s3_encryption_key.is_empty() {
            self.ui.message(&format!(
                "Ignoring s3_encryption_key because s3_encryption is set to '{}'",
                config.s3_encryption
            ));
        }

        tokio::fs::metadata(source).await.map_err(|err| {
            AmiforgeError::Io(format!("failed to open {}: {err}", source.display()))
        })?;

        self.ui
            .message(&format!("Uploading {} to {}", source.display(), self.location()));
        let request = UploadRequest {
            bucket: config.s3_bucket_name.clone(),
            key: self.key.clone(),
            source: source.to_path_buf(),
            server_side_encryption: (!config.s3_encryption.is_empty())
                .then(|| config.s3_encryption.clone()),
            kms_key_id: config.upload_kms_key(),
        };
        services
            .cloud()
            .s3(&config.access.region)
            .upload(&request)
            .await
            .map_err(|err| {
                AmiforgeError::step(format!("failed to upload {}: {err}", source.display()))
            })?;
        self.ui.message(&format!(
            "Completed upload of {} to {}",
            source.display(),
            self.location()
        ));
        Ok(())
    }

    async fn start_import(&self, ctx: &RenderContext) -> Result<String, AmiforgeError> {
        let mut request = self.config.import_request(&self.key);
        request.description = ctx.render("packer-import-{{timestamp}}").unwrap_or_default();
        if let Some(license) = &request.license_type {
            self.ui.message(&format!("Setting license type to '{license}'"));
        }

        let ec2 = self.ec2.as_ref();
        let request = &request;
        let task_id = RetryConfig::import_image()
            .run(self.cancel, "ImportImage", || async move { ec2.import_image(request).await })
            .await
            .map_err(|err| {
                AmiforgeError::step(format!(
                    "failed to start import from {}: {err}",
                    self.location()
                ))
            })?;

        info!(task_id = %task_id, key = %self.key, "Import started");
        self.ui.message(&format!(
            "Started import of {}, task id {task_id}",
            self.location()
        ));
        Ok(task_id)
    }

    async fn wait_for_task(&self, task_id: &str, options: WaitOptions) -> Result<String, AmiforgeError> {
        self.ui
            .message(&format!("Waiting for task {task_id} to complete (may take a while)"));

        let task = match wait_for_import(self.cancel, self.ec2.as_ref(), task_id, options).await {
            Ok(task) => task,
            Err(WaitError::Failed { status_message, .. }) => {
                return Err(AmiforgeError::step(format!(
                    "Import task {task_id} failed with status message: {status_message}"
                )));
            }
            Err(WaitError::Cancelled(reason)) => return Err(AmiforgeError::Cancelled(reason)),
            Err(err) => {
                return Err(AmiforgeError::step(format!(
                    "Import task {task_id} did not complete: {err}"
                )));
            }
        };

        self.ui.message(&format!("Import task {task_id} complete"));
        task.image_id.ok_or_else(|| {
            AmiforgeError::step(format!("Import task {task_id} completed without an image id"))
        })
    }

    async fn rename(
        &self,
        region: &str,
        image_id: &str,
        options: WaitOptions,
    ) -> Result<String, AmiforgeError> {
        let config = self.config;
        self.ui.message(&format!("Starting rename of AMI ({image_id})"));

        let request = CopyImageRequest {
            source_region: region.to_string(),
            source_image_id: image_id.to_string(),
            name: config.ami_name.clone(),
            description: String::new(),
            encrypted: config.ami_encrypt,
            kms_key_id: (config.ami_encrypt && !config.ami_kms_key.is_empty())
                .then(|| config.ami_kms_key.clone()),
        };
        let renamed = self.ec2.copy_image(&request).await.map_err(|err| {
            AmiforgeError::step(format!("error copying AMI ({image_id}): {err}"))
        })?;

        self.ui.message("Waiting for AMI rename to complete (may take a while)");
        wait_for_image(self.cancel, self.ec2.as_ref(), &renamed, options)
            .await
            .map_err(|err| AmiforgeError::step(format!("error waiting for AMI ({renamed}): {err}")))?;

        self.ui.message("Destroying intermediary AMI...");
        destroy_amis(self.ec2.as_ref(), &[image_id.to_string()], true)
            .await
            .map_err(|err| {
                AmiforgeError::step(format!("error deregistering intermediary AMI {image_id}: {err}"))
            })?;

        self.ui.message("AMI rename completed");
        Ok(renamed)
    }

    async fn tag(&self, image_id: &str) -> Result<(), AmiforgeError> {
        for (key, value) in &self.config.tags {
            self.ui.message(&format!("Adding tag \"{key}\": \"{value}\""));
        }

        let images = self
            .ec2
            .describe_images(&ImageQuery::ids([image_id]))
            .await
            .map_err(|err| {
                AmiforgeError::step(format!("failed to retrieve details for AMI {image_id}: {err}"))
            })?;
        let image = images
            .into_iter()
            .next()
            .ok_or_else(|| AmiforgeError::step(format!("AMI {image_id} has no images")))?;

        let mut resources = vec![image_id.to_string()];
        for snapshot_id in image.snapshot_ids() {
            self.ui.message(&format!("Tagging snapshot {snapshot_id}"));
            resources.push(snapshot_id);
        }

        self.ui.message(&format!("Tagging AMI {image_id}"));
        self.ec2
            .create_tags(&resources, &self.config.tags)
            .await
            .map_err(|err| {
                AmiforgeError::step(format!("failed to add tags to resources {resources:?}: {err}"))
            })
    }

    async fn modify_attributes(&self, image_id: &str) -> Result<(), AmiforgeError> {
        for (name, change) in self.config.modifications() {
            self.ui.message(&format!("Modifying: {name}"));
            self.ec2
                .modify_image_attribute(image_id, &change)
                .await
                .map_err(|err| {
                    AmiforgeError::step(format!("error modifying AMI {image_id} attributes ({name}): {err}"))
                })?;
        }
        Ok(())
    }

    async fn delete_source(&self, services: &BuildServices) -> Result<(), AmiforgeError> {
        self.ui
            .message(&format!("Deleting import source {}", self.location()));
        services
            .cloud()
            .s3(&self.config.access.region)
            .delete_object(&self.config.s3_bucket_name, &self.key)
            .await
            .map_err(|err| AmiforgeError::step(format!("failed to delete {}: {err}", self.location())))
    }
}
