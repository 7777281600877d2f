//! A ready-wired state bag over a [`FakeCloud`].

use super::{CollectingUi, FakeCloud};
use crate::context::keys::{CLOUD, EC2, IAM, POLLING, REGION, UI};
use crate::context::StateBag;
use crate::pipeline::{PollingSource, ResolvedPolling};
use std::sync::Arc;
use std::time::Duration;

/// A state bag holding the build-region clients, a collecting UI and fast
/// polling, plus handles to inspect them.
#[derive(Debug)]
pub struct TestState {
    /// The cloud behind every client.
    pub cloud: FakeCloud,
    /// Lines written by steps.
    pub ui: Arc<CollectingUi>,
    /// The bag passed to steps.
    pub state: StateBag,
}

impl TestState {
    /// Wires a bag for a build in `region`.
    #[must_use]
    pub fn new(region: &str) -> Self {
        let cloud = FakeCloud::new(region);
        let ui = Arc::new(CollectingUi::new());
        let state = StateBag::new();
        state.put(REGION, region.to_string());
        state.put(CLOUD, cloud.provider());
        state.put(EC2, cloud.provider().ec2(region));
        state.put(IAM, cloud.provider().iam());
        state.put(UI, ui.clone());
        state.put(
            POLLING,
            ResolvedPolling {
                max_attempts: Some(20),
                delay: Some(Duration::from_millis(10)),
                source: PollingSource::Explicit,
            },
        );
        Self { cloud, ui, state }
    }
}
