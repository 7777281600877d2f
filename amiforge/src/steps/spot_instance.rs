//! Spot launch of the source instance.

use super::generated_data::{launch_data, publish, render_tags};
use super::run_instance::{terminate, LaunchSettings};
use super::{ec2, halt, try_step, ui, wait_for_instance, wait_for_spot_request, wait_options, Step};
use crate::cancellation::CancellationToken;
use crate::cloud::{InstanceState, SpotInstanceRequest, Tags};
use crate::context::keys::{INSTANCE, INSTANCE_ID, SPOT_REQUEST_ID};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use crate::pipeline::WaiterDefaults;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

#[derive(Debug, Default)]
struct Launched {
    request_id: Option<String>,
    instance_id: Option<String>,
}

/// Launches the source instance through a one-time spot request.
///
/// Publishes `spot_request_id`, then the same `instance_id` and `instance`
/// keys as the on-demand launch. Cleanup terminates the instance, or cancels
/// the request if it was never fulfilled.
#[derive(Debug, Default)]
pub struct RunSpotInstance {
    settings: LaunchSettings,
    spot_price: String,
    instance_types: Vec<String>,
    spot_tags: Tags,
    launched: Mutex<Launched>,
}

impl RunSpotInstance {
    /// Creates the step bidding `spot_price` (`auto` lets the service decide).
    #[must_use]
    pub fn new(settings: LaunchSettings, spot_price: impl Into<String>) -> Self {
        Self {
            settings,
            spot_price: spot_price.into(),
            ..Self::default()
        }
    }

    /// Alternative instance types for the request.
    #[must_use]
    pub fn with_instance_types(mut self, types: Vec<String>) -> Self {
        self.instance_types = types;
        self
    }

    /// Tags for the spot request itself.
    #[must_use]
    pub fn with_spot_tags(mut self, tags: Tags) -> Self {
        self.spot_tags = tags;
        self
    }

    fn request(&self, state: &StateBag) -> Result<SpotInstanceRequest, AmiforgeError> {
        let mut launch = self.settings.request(state)?;
        if launch.instance_type.is_empty() {
            if let Some(first) = self.instance_types.first() {
                launch.instance_type = first.clone();
            }
        }
        Ok(SpotInstanceRequest {
            launch,
            spot_price: self.spot_price.clone(),
            instance_types: self.instance_types.clone(),
            spot_tags: render_tags(state, &self.settings.render_ctx, &self.spot_tags)?,
        })
    }
}

#[async_trait]
impl Step for RunSpotInstance {
    fn name(&self) -> &str {
        "run_spot_instance"
    }

    async fn run(&self, cancel: &CancellationToken, state: &StateBag) -> StepAction {
        let ec2 = try_step!(state, ec2(state));
        let request = try_step!(state, self.request(state));

        ui(state).say("Launching a spot AWS instance...");
        let spot = match ec2.request_spot_instance(&request).await {
            Ok(spot) => spot,
            Err(err) => {
                return halt(state, AmiforgeError::step(format!("error requesting spot instance: {err}")))
            }
        };
        self.launched.lock().request_id = Some(spot.id.clone());
        state.put(SPOT_REQUEST_ID, spot.id.clone());
        info!(spot_request_id = %spot.id, price = %self.spot_price, "Submitted spot request");
        ui(state).message(&format!("Waiting for spot request ({}) to be fulfilled...", spot.id));

        let options = wait_options(state, WaiterDefaults::SPOT_REQUEST);
        let fulfilled = match wait_for_spot_request(cancel, ec2.as_ref(), &spot.id, options).await {
            Ok(fulfilled) => fulfilled,
            Err(err) => {
                return halt(
                    state,
                    AmiforgeError::step(format!(
                        "error waiting for spot request ({}) to become active: {err}",
                        spot.id
                    )),
                )
            }
        };
        let Some(instance_id) = fulfilled.instance_id else {
            return halt(
                state,
                AmiforgeError::step(format!("spot request {} has no instance", spot.id)),
            );
        };

        self.launched.lock().instance_id = Some(instance_id.clone());
        state.put(INSTANCE_ID, instance_id.clone());
        ui(state).message(&format!("Instance ID: {instance_id}"));

        let options = wait_options(state, WaiterDefaults::STANDARD);
        let instance =
            match wait_for_instance(cancel, ec2.as_ref(), &instance_id, InstanceState::Running, options).await {
                Ok(instance) => instance,
                Err(err) => {
                    return halt(
                        state,
                        AmiforgeError::step(format!(
                            "error waiting for instance ({instance_id}) to become ready: {err}"
                        )),
                    )
                }
            };

        // Spot requests do not propagate their tags to the instance.
        let instance_tags = &request.launch.instance_tags;
        if !instance_tags.is_empty() {
            if let Err(err) = ec2.create_tags(&[instance_id.clone()], instance_tags).await {
                return halt(
                    state,
                    AmiforgeError::step(format!("error tagging spot instance {instance_id}: {err}")),
                );
            }
        }

        state.put(INSTANCE, instance);
        publish(state, launch_data(state));
        StepAction::Continue
    }

    async fn cleanup(&self, state: &StateBag) {
        let launched = std::mem::take(&mut *self.launched.lock());
        let Ok(ec2) = ec2(state) else {
            return;
        };

        if let Some(instance_id) = launched.instance_id {
            terminate(state, ec2.as_ref(), &instance_id).await;
            return;
        }

        if let Some(request_id) = launched.request_id {
            ui(state).say("Cancelling the spot request...");
            if let Err(err) = ec2.cancel_spot_request(&request_id).await {
                warn!(spot_request_id = %request_id, error = %err, "Failed to cancel spot request");
                ui(state).error(&format!("Error cancelling spot request {request_id}: {err}"));
            }
        }
    }
}
