//! Values exposed to templates once the source instance is known.

use super::Step;
use crate::cancellation::CancellationToken;
use crate::cloud::Tags;
use crate::config::{RenderContext, TemplateError};
use crate::context::keys::{GENERATED_DATA, REGION, SOURCE_IMAGE};
use crate::context::StateBag;
use crate::core::StepAction;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tracing::debug;

/// Data derived from the build region and the source image.
pub(crate) fn launch_data(state: &StateBag) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    if let Some(region) = state.get_ok(REGION) {
        data.insert("BuildRegion".to_string(), region);
    }
    if let Some(image) = state.get_ok(SOURCE_IMAGE) {
        data.insert("SourceAMI".to_string(), image.id);
        data.insert("SourceAMIName".to_string(), image.name);
        data.insert("SourceAMICreationDate".to_string(), image.creation_date);
    }
    data
}

/// Merges `data` into the published generated data.
pub(crate) fn publish(state: &StateBag, data: BTreeMap<String, String>) {
    state.update(GENERATED_DATA, |current| current.extend(data));
}

/// Renders `template` with everything known about the build so far.
pub(crate) fn render(
    state: &StateBag,
    ctx: &RenderContext,
    template: &str,
) -> Result<String, TemplateError> {
    let mut data = launch_data(state);
    if let Some(published) = state.get_ok(GENERATED_DATA) {
        data.extend(published);
    }
    ctx.clone().with_all_data(&data).render(template)
}

/// Renders every tag value; keys are taken literally.
pub(crate) fn render_tags(
    state: &StateBag,
    ctx: &RenderContext,
    tags: &Tags,
) -> Result<Tags, TemplateError> {
    tags.iter()
        .map(|(key, value)| Ok((key.clone(), render(state, ctx, value)?)))
        .collect()
}

/// Publishes `BuildRegion`, `SourceAMI` and friends under `generated_data`.
#[derive(Debug, Default)]
pub struct SetGeneratedData;

#[async_trait]
impl Step for SetGeneratedData {
    fn name(&self) -> &str {
        "set_generated_data"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &StateBag) -> StepAction {
        let data = launch_data(state);
        debug!(keys = ?data.keys().collect::<Vec<_>>(), "Publishing generated data");
        publish(state, data);
        StepAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::Image;

    #[tokio::test]
    async fn test_publishes_source_and_region() {
        let state = StateBag::new();
        state.put(REGION, "eu-west-1".to_string());
        state.put(
            SOURCE_IMAGE,
            Image {
                id: "ami-source".to_string(),
                name: "base".to_string(),
                creation_date: "2024-01-01T00:00:00Z".to_string(),
                ..Image::default()
            },
        );

        let action = SetGeneratedData.run(&CancellationToken::new(), &state).await;
        assert_eq!(action, StepAction::Continue);

        let data = state.get(GENERATED_DATA).unwrap();
        assert_eq!(data["BuildRegion"], "eu-west-1");
        assert_eq!(data["SourceAMI"], "ami-source");
        assert_eq!(data["SourceAMIName"], "base");
    }

    #[test]
    fn test_render_uses_state() {
        let state = StateBag::new();
        state.put(REGION, "us-west-2".to_string());
        let name = render(&state, &RenderContext::new(), "app-{{ .BuildRegion }}").unwrap();
        assert_eq!(name, "app-us-west-2");
    }
}
