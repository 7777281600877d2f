//! Session Manager port forwarding to the instance.

use super::{halt, try_step, ui, Step};
use crate::cancellation::CancellationToken;
use crate::context::keys::{INSTANCE_ID, SSH_HOST, SSH_PORT};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// An open port forward.
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Local port that forwards to the instance.
    fn local_port(&self) -> u16;

    /// Closes the forward.
    async fn close(&self) -> Result<(), AmiforgeError>;
}

/// Opens port forwards through Session Manager.
#[async_trait]
pub trait TunnelOpener: Send + Sync {
    /// Forwards `local_port` (`0` picks a free one) to `remote_port` on the instance.
    async fn open(
        &self,
        instance_id: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Box<dyn Tunnel>, AmiforgeError>;
}

/// Opens a tunnel when the communicator uses the `session_manager` interface.
///
/// Publishes `ssh_host` as `localhost` and `ssh_port` as the tunnel's local
/// port so [`super::Connect`] goes through it.
pub struct CreateSsmTunnel {
    opener: Option<Arc<dyn TunnelOpener>>,
    local_port: u16,
    remote_port: u16,
    tunnel: Mutex<Option<Box<dyn Tunnel>>>,
}

impl fmt::Debug for CreateSsmTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateSsmTunnel")
            .field("enabled", &self.opener.is_some())
            .field("local_port", &self.local_port)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}

impl CreateSsmTunnel {
    /// A step that does nothing.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            opener: None,
            local_port: 0,
            remote_port: 0,
            tunnel: Mutex::new(None),
        }
    }

    /// Forwards `local_port` to `remote_port` through `opener`.
    #[must_use]
    pub fn new(opener: Arc<dyn TunnelOpener>, local_port: u16, remote_port: u16) -> Self {
        Self {
            opener: Some(opener),
            local_port,
            remote_port,
            tunnel: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Step for CreateSsmTunnel {
    fn name(&self) -> &str {
        "create_ssm_tunnel"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &StateBag) -> StepAction {
        let Some(opener) = &self.opener else {
            return StepAction::Continue;
        };
        let instance_id = try_step!(state, state.get(INSTANCE_ID));

        ui(state).say(&format!(
            "Starting port forwarding session to {instance_id} on port {}...",
            self.remote_port
        ));
        let tunnel = match opener.open(&instance_id, self.local_port, self.remote_port).await {
            Ok(tunnel) => tunnel,
            Err(err) => {
                return halt(
                    state,
                    AmiforgeError::step(format!("error creating session manager tunnel: {err}")),
                )
            }
        };

        let port = tunnel.local_port();
        *self.tunnel.lock() = Some(tunnel);
        info!(instance_id = %instance_id, local_port = port, "Session manager tunnel open");
        state.put(SSH_HOST, "localhost".to_string());
        state.put(SSH_PORT, port);
        StepAction::Continue
    }

    async fn cleanup(&self, state: &StateBag) {
        let Some(tunnel) = self.tunnel.lock().take() else {
            return;
        };
        ui(state).say("Closing port forwarding session...");
        if let Err(err) = tunnel.close().await {
            warn!(error = %err, "Failed to close session manager tunnel");
        }
    }
}
