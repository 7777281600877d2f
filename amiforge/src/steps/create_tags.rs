//! Tags every AMI and the snapshots behind it.

use super::generated_data::render_tags;
use super::{ec2_for, halt, try_step, ui, Step};
use crate::cancellation::CancellationToken;
use crate::cloud::Tags;
use crate::config::RenderContext;
use crate::context::keys::{AMIS, SNAPSHOTS};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::{AmiforgeError, CloudError};
use crate::pipeline::RetryConfig;
use async_trait::async_trait;
use tracing::info;

/// Applies `tags` to every AMI and its snapshots, and `snapshot_tags` to the
/// snapshots only. Tag values are rendered with the build's generated data.
#[derive(Debug, Default)]
pub struct CreateTags {
    tags: Tags,
    snapshot_tags: Tags,
    render_ctx: RenderContext,
}

impl CreateTags {
    /// Creates the step.
    #[must_use]
    pub fn new(tags: Tags, snapshot_tags: Tags, render_ctx: RenderContext) -> Self {
        Self {
            tags,
            snapshot_tags,
            render_ctx,
        }
    }
}

#[async_trait]
impl Step for CreateTags {
    fn name(&self) -> &str {
        "create_tags"
    }

    async fn run(&self, cancel: &CancellationToken, state: &StateBag) -> StepAction {
        if self.tags.is_empty() && self.snapshot_tags.is_empty() {
            return StepAction::Continue;
        }
        let Some(amis) = state.get_ok(AMIS) else {
            return StepAction::Continue;
        };
        let snapshots = state.get_ok(SNAPSHOTS).unwrap_or_default();

        let ami_tags = try_step!(state, render_tags(state, &self.render_ctx, &self.tags));
        let mut snapshot_tags = ami_tags.clone();
        snapshot_tags.extend(try_step!(
            state,
            render_tags(state, &self.render_ctx, &self.snapshot_tags)
        ));

        for (region, image_id) in &amis {
            let ec2 = try_step!(state, ec2_for(state, region));
            let snapshot_ids = snapshots.get(region).cloned().unwrap_or_default();

            let mut batches: Vec<(Vec<String>, &Tags)> = Vec::new();
            if !ami_tags.is_empty() {
                ui(state).say(&format!("Adding tags to AMI ({image_id})..."));
                batches.push((vec![image_id.clone()], &ami_tags));
            }
            if !snapshot_tags.is_empty() && !snapshot_ids.is_empty() {
                ui(state).say(&format!("Adding tags to snapshots of AMI ({image_id})..."));
                batches.push((snapshot_ids, &snapshot_tags));
            }

            for (ids, tags) in batches {
                // A copy may not be visible to the tagging API right away.
                let tagged = RetryConfig::default()
                    .with_tries(11)
                    .run_if(
                        cancel,
                        "CreateTags",
                        |err: &CloudError| err.is_not_found(),
                        || ec2.create_tags(&ids, tags),
                    )
                    .await;
                if let Err(err) = tagged {
                    return halt(
                        state,
                        AmiforgeError::step(format!("error adding tags to resources {ids:?}: {err}")),
                    );
                }
            }
            info!(region = %region, image_id = %image_id, "Tagged AMI");
        }
        StepAction::Continue
    }
}
