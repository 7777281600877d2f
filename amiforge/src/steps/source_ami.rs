//! Resolves the image the instance is launched from.

use super::{ec2, halt, try_step, ui, Step};
use crate::cancellation::CancellationToken;
use crate::cloud::{Image, ImageQuery};
use crate::config::AmiFilter;
use crate::context::keys::SOURCE_IMAGE;
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use async_trait::async_trait;
use tracing::info;

/// Looks up the source AMI by id or by filter and publishes `source_image`.
#[derive(Debug, Clone, Default)]
pub struct SourceAmiInfo {
    source_ami: String,
    filter: AmiFilter,
    ena_support: Option<bool>,
}

impl SourceAmiInfo {
    /// Creates the step.
    #[must_use]
    pub fn new(source_ami: impl Into<String>, filter: AmiFilter) -> Self {
        Self {
            source_ami: source_ami.into(),
            filter,
            ena_support: None,
        }
    }

    /// Requires an HVM image when ENA is to be enabled.
    #[must_use]
    pub const fn with_ena_support(mut self, ena_support: Option<bool>) -> Self {
        self.ena_support = ena_support;
        self
    }

    fn query(&self) -> ImageQuery {
        let mut query = self.filter.to_query();
        if !self.source_ami.is_empty() {
            query.image_ids = vec![self.source_ami.clone()];
        }
        query
    }

    fn pick(&self, mut images: Vec<Image>) -> Result<Image, AmiforgeError> {
        if images.is_empty() {
            return Err(AmiforgeError::step(
                "no AMI was found matching filters; check source_ami or source_ami_filter",
            ));
        }
        if images.len() > 1 && !self.filter.most_recent {
            return Err(AmiforgeError::step(
                "your query returned more than one result; please try a more specific search, \
                 or set most_recent to true",
            ));
        }

        images.sort_by(|a, b| a.creation_date.cmp(&b.creation_date));
        images
            .pop()
            .ok_or_else(|| AmiforgeError::step("no AMI was found matching filters"))
    }
}

#[async_trait]
impl Step for SourceAmiInfo {
    fn name(&self) -> &str {
        "source_ami_info"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &StateBag) -> StepAction {
        let ec2 = try_step!(state, ec2(state));
        ui(state).say("Inspecting the source AMI...");

        let images = try_step!(state, ec2.describe_images(&self.query()).await);
        let image = try_step!(state, self.pick(images));

        if self.ena_support == Some(true) && image.virtualization_type != "hvm" {
            return halt(
                state,
                AmiforgeError::step(format!(
                    "cannot enable enhanced networking on {} AMI {}",
                    image.virtualization_type, image.id
                )),
            );
        }

        info!(image_id = %image.id, name = %image.name, "Found source image");
        ui(state).message(&format!("Found Image ID: {}", image.id));
        state.put(SOURCE_IMAGE, image);
        StepAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: &str, created: &str) -> Image {
        Image {
            id: id.to_string(),
            creation_date: created.to_string(),
            ..Image::default()
        }
    }

    #[test]
    fn test_most_recent_wins() {
        let step = SourceAmiInfo::new(
            "",
            AmiFilter {
                most_recent: true,
                ..AmiFilter::default()
            },
        );
        let picked = step
            .pick(vec![
                image("ami-old", "2023-01-01T00:00:00Z"),
                image("ami-new", "2024-06-01T00:00:00Z"),
                image("ami-mid", "2023-09-01T00:00:00Z"),
            ])
            .unwrap();
        assert_eq!(picked.id, "ami-new");
    }

    #[test]
    fn test_ambiguous_without_most_recent() {
        let step = SourceAmiInfo::new("", AmiFilter::default());
        let err = step
            .pick(vec![image("ami-a", "1"), image("ami-b", "2")])
            .unwrap_err();
        assert!(err.to_string().contains("more than one result"));
        assert!(step.pick(Vec::new()).is_err());
    }

    #[test]
    fn test_explicit_id_overrides_filter_ids() {
        let query = SourceAmiInfo::new("ami-123", AmiFilter::default()).query();
        assert_eq!(query.image_ids, vec!["ami-123".to_string()]);
    }
}
