//! The builders and the import post-processor.
//!
//! A builder validates its whole configuration up front, wires the clients
//! and collaborators into a fresh [`StateBag`], runs its step list through a
//! [`StepRunner`] and turns what the steps published into an [`Artifact`].
//!
//! [`Artifact`]: crate::core::Artifact

mod ebs;
mod ebs_volume;
mod import;

pub use ebs::{EbsBuilder, EbsConfig};
pub use ebs_volume::{EbsVolumeBuilder, EbsVolumeConfig};
pub use import::ImportPostProcessor;

use crate::cancellation::CancellationToken;
use crate::cloud::CloudProvider;
use crate::config::{AccessConfig, RunConfig};
use crate::context::keys::{CLOUD, CONFIG, EC2, ERROR, HOOK, IAM, POLLING, REGION, UI};
use crate::context::StateBag;
use crate::core::RunStatus;
use crate::errors::AmiforgeError;
use crate::observability::{LoggingUi, RedactingUi, Ui};
use crate::pipeline::{EnvSource, PollingConfig, ProcessEnv, ResolvedPolling, StepRunner};
use crate::steps::{Connector, CreateSsmTunnel, Hook, Step, TunnelOpener};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything a run talks to besides its configuration.
#[derive(Clone)]
pub struct BuildServices {
    cloud: Arc<dyn CloudProvider>,
    ui: Arc<dyn Ui>,
    hook: Option<Arc<dyn Hook>>,
    connector: Option<Arc<dyn Connector>>,
    tunnels: Option<Arc<dyn TunnelOpener>>,
    env: Arc<dyn EnvSource + Send + Sync>,
}

impl fmt::Debug for BuildServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildServices")
            .field("default_region", &self.cloud.default_region())
            .field("ui", &self.ui)
            .field("hook", &self.hook.is_some())
            .field("connector", &self.connector.is_some())
            .field("tunnels", &self.tunnels.is_some())
            .finish_non_exhaustive()
    }
}

impl BuildServices {
    /// Services over `cloud`, logging progress through `tracing` and reading
    /// polling overrides from the process environment.
    #[must_use]
    pub fn new(cloud: Arc<dyn CloudProvider>) -> Self {
        Self {
            cloud,
            ui: Arc::new(LoggingUi::default()),
            hook: None,
            connector: None,
            tunnels: None,
            env: Arc::new(ProcessEnv),
        }
    }

    /// Sets the diagnostics stream.
    #[must_use]
    pub fn with_ui(mut self, ui: Arc<dyn Ui>) -> Self {
        self.ui = ui;
        self
    }

    /// Sets the provisioning hook.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Sets how communicator sessions are established.
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Sets how Session Manager port forwards are opened.
    #[must_use]
    pub fn with_tunnel_opener(mut self, tunnels: Arc<dyn TunnelOpener>) -> Self {
        self.tunnels = Some(tunnels);
        self
    }

    /// Sets where polling overrides are read from.
    #[must_use]
    pub fn with_env(mut self, env: Arc<dyn EnvSource + Send + Sync>) -> Self {
        self.env = env;
        self
    }

    /// The cloud the run talks to.
    #[must_use]
    pub fn cloud(&self) -> Arc<dyn CloudProvider> {
        self.cloud.clone()
    }

    /// The diagnostics stream with the run's credentials masked.
    pub(crate) fn redacted_ui(&self, access: &AccessConfig) -> Arc<dyn Ui> {
        Arc::new(RedactingUi::new(self.ui.clone(), access.secret_filter()))
    }

    pub(crate) fn resolve_polling(&self, polling: &PollingConfig) -> ResolvedPolling {
        polling.resolve(self.env.as_ref())
    }

    /// The tunnel step for `run`, or an error if Session Manager is asked
    /// for without a way to open tunnels.
    pub(crate) fn ssm_tunnel(&self, run: &RunConfig) -> Result<CreateSsmTunnel, AmiforgeError> {
        if !run.ssm_agent_enabled() {
            return Ok(CreateSsmTunnel::disabled());
        }
        let opener = self.tunnels.clone().ok_or_else(|| {
            AmiforgeError::step("the session_manager interface needs a tunnel opener")
        })?;
        Ok(CreateSsmTunnel::new(
            opener,
            run.session_manager_port,
            run.communicator.port(),
        ))
    }

    pub(crate) fn connector(&self) -> Option<Arc<dyn Connector>> {
        self.connector.clone()
    }

    /// A bag holding the clients, collaborators and resolved polling for a
    /// build in `access.region`.
    pub(crate) fn state_for(&self, access: &AccessConfig, run: &RunConfig) -> StateBag {
        let state = StateBag::new();
        state.put(REGION, access.region.clone());
        state.put(CLOUD, self.cloud.clone());
        state.put(EC2, self.cloud.ec2(&access.region));
        state.put(IAM, self.cloud.iam());
        state.put(UI, self.redacted_ui(access));
        state.put(CONFIG, Arc::new(run.clone()));
        state.put(POLLING, self.resolve_polling(&run.aws_polling));
        if let Some(hook) = &self.hook {
            state.put(HOOK, hook.clone());
        }
        state
    }
}

/// Runs `steps` and returns the run's error, if any.
pub(crate) async fn execute(
    builder: &str,
    steps: Vec<Arc<dyn Step>>,
    cancel: &CancellationToken,
    state: &StateBag,
) -> Result<(), AmiforgeError> {
    let runner = StepRunner::new(steps);
    info!(builder, steps = ?runner.step_names(), "Starting build");
    let report = runner.run(cancel, state).await;

    if report.status == RunStatus::Cancelled {
        let reason = cancel.reason().unwrap_or_default();
        warn!(builder, reason = %reason, "Build cancelled");
        return Err(AmiforgeError::Cancelled(reason));
    }
    if let Some(err) = state.get_ok(ERROR) {
        warn!(builder, status = %report.status, error = %err, "Build failed");
        return Err(err);
    }
    info!(builder, "Build finished");
    Ok(())
}

#[cfg(test)]
mod builder_tests;
