//! Build steps.
//!
//! A step is one unit of work with a `run` and a `cleanup`. Steps hold only
//! their own settings; everything they exchange goes through the
//! [`StateBag`] under the keys in [`crate::context::keys`].
//!
//! A step that fails records the error with [`halt`] and returns
//! [`StepAction::Halt`]. The runner then unwinds through the cleanups of every
//! step that ran.

/// Unwraps a result inside `run`, halting on error.
macro_rules! try_step {
    ($state:expr, $result:expr) => {
        match $result {
            Ok(value) => value,
            Err(err) => return $crate::steps::halt($state, err),
        }
    };
}
pub(crate) use try_step;

mod ami_name;
mod ami_region_copy;
mod cleanup_temp_keys;
mod connect;
mod create_ami;
mod create_tags;
mod deregister_ami;
mod generated_data;
mod iam_profile;
mod key_pair;
mod modify_ami_attributes;
mod modify_instance;
mod network;
mod provision;
mod run_instance;
mod security_group;
mod snapshot_volumes;
mod source_ami;
mod spot_instance;
mod ssm_tunnel;
mod stop_instance;
mod tag_volumes;
mod waiters;

pub use ami_name::AmiNamePreValidate;
pub use ami_region_copy::AmiRegionCopy;
pub use cleanup_temp_keys::CleanupTempKeys;
pub use connect::{host_for, Communicator, Connect, ConnectTarget, Connector};
pub use create_ami::CreateAmi;
pub use create_tags::CreateTags;
pub use deregister_ami::DeregisterAmi;
pub use generated_data::SetGeneratedData;
pub use iam_profile::IamInstanceProfile;
pub use key_pair::KeyPairStep;
pub use modify_ami_attributes::ModifyAmiAttributes;
pub use modify_instance::ModifyEbsBackedInstance;
pub use network::NetworkInfo;
pub use provision::{Hook, Provision, HOOK_PROVISION};
pub use run_instance::{LaunchSettings, RunSourceInstance};
pub use security_group::SecurityGroupStep;
pub use snapshot_volumes::SnapshotEbsVolumes;
pub use source_ami::SourceAmiInfo;
pub use spot_instance::RunSpotInstance;
pub use ssm_tunnel::{CreateSsmTunnel, Tunnel, TunnelOpener};
pub use stop_instance::StopInstance;
pub use tag_volumes::TagEbsVolumes;
pub use waiters::{
    wait_for_image, wait_for_import, wait_for_instance, wait_for_snapshot, wait_for_spot_request,
};

use crate::cancellation::CancellationToken;
use crate::cloud::Ec2Api;
use crate::context::keys::{CLOUD, EC2, ERROR, POLLING, REGION, UI};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use crate::observability::{NoOpUi, Ui};
use crate::pipeline::{WaitOptions, WaiterDefaults};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::error;

/// One unit of build work.
///
/// `run` must publish any resource it creates before returning so that
/// `cleanup` can act on partial state. `cleanup` runs for every step whose
/// `run` was entered, in reverse order, whether the build succeeded or not.
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Does the work.
    async fn run(&self, cancel: &CancellationToken, state: &StateBag) -> StepAction;

    /// Tears down what `run` created. Errors are logged, never propagated.
    async fn cleanup(&self, _state: &StateBag) {}
}

/// Records `err` as the run's error (first one wins), reports it and halts.
pub fn halt(state: &StateBag, err: impl Into<AmiforgeError>) -> StepAction {
    let err = err.into();
    error!(error = %err, "Step failed");
    ui(state).error(&err.to_string());
    if !state.contains(ERROR) {
        state.put(ERROR, err);
    }
    StepAction::Halt
}

/// The diagnostics stream, or a no-op one if none was published.
pub(crate) fn ui(state: &StateBag) -> Arc<dyn Ui> {
    state.get_ok(UI).unwrap_or_else(|| Arc::new(NoOpUi))
}

/// The EC2 client for the build region.
pub(crate) fn ec2(state: &StateBag) -> Result<Arc<dyn Ec2Api>, AmiforgeError> {
    Ok(state.get(EC2)?)
}

/// The EC2 client for `region`, reusing the build region's client.
pub(crate) fn ec2_for(state: &StateBag, region: &str) -> Result<Arc<dyn Ec2Api>, AmiforgeError> {
    if state.get_ok(REGION).as_deref() == Some(region) {
        if let Some(ec2) = state.get_ok(EC2) {
            return Ok(ec2);
        }
    }
    Ok(state.get(CLOUD)?.ec2(region))
}

/// Waiter parameters from the run's resolved polling overrides.
pub(crate) fn wait_options(state: &StateBag, defaults: WaiterDefaults) -> WaitOptions {
    state
        .get_ok(POLLING)
        .unwrap_or_default()
        .for_waiter(defaults)
}
