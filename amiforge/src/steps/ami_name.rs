//! Renders the AMI name and checks it before anything is launched.

use super::generated_data::render;
use super::{ec2, halt, try_step, ui, Step};
use crate::cancellation::CancellationToken;
use crate::cloud::ImageQuery;
use crate::config::{ami_name_errors, RenderContext};
use crate::context::keys::AMI_NAME;
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use async_trait::async_trait;
use tracing::info;

/// Renders `ami_name`, validates it and fails early if the name is taken.
///
/// The rendered name is published under `ami_name` so later steps use the
/// exact same value.
#[derive(Debug, Clone)]
pub struct AmiNamePreValidate {
    name_template: String,
    force_deregister: bool,
    render_ctx: RenderContext,
}

impl AmiNamePreValidate {
    /// Creates the step.
    #[must_use]
    pub fn new(name_template: impl Into<String>, render_ctx: RenderContext) -> Self {
        Self {
            name_template: name_template.into(),
            force_deregister: false,
            render_ctx,
        }
    }

    /// Skips the "name already used" check; the AMI is deregistered later.
    #[must_use]
    pub const fn with_force_deregister(mut self, force: bool) -> Self {
        self.force_deregister = force;
        self
    }
}

#[async_trait]
impl Step for AmiNamePreValidate {
    fn name(&self) -> &str {
        "ami_name_pre_validate"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &StateBag) -> StepAction {
        let name = try_step!(state, render(state, &self.render_ctx, &self.name_template));

        let problems = ami_name_errors(&name);
        if !problems.is_empty() {
            return halt(
                state,
                AmiforgeError::step(format!("invalid AMI name {name:?}: {}", problems.join("; "))),
            );
        }
        state.put(AMI_NAME, name.clone());

        if self.force_deregister {
            ui(state).say("Force deregister flag found, skipping prevalidating AMI name");
            return StepAction::Continue;
        }

        ui(state).say(&format!("Prevalidating AMI name: {name}"));
        let ec2 = try_step!(state, ec2(state));
        let existing = try_step!(state, ec2.describe_images(&ImageQuery::by_name(&name)).await);

        if let Some(image) = existing.first() {
            return halt(
                state,
                AmiforgeError::step(format!(
                    "AMI name '{name}' is used by an existing AMI: {}",
                    image.id
                )),
            );
        }

        info!(ami_name = %name, "AMI name is available");
        StepAction::Continue
    }
}
