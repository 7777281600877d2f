//! Connecting the communicator to the instance.

use super::{halt, try_step, ui, Step};
use crate::cancellation::CancellationToken;
use crate::cloud::Instance;
use crate::config::{CommunicatorConfig, CommunicatorType, SshInterface};
use crate::context::keys::{COMMUNICATOR, INSTANCE, PRIVATE_KEY, SSH_HOST, SSH_PORT};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// A connected SSH or WinRM session.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Removes the temporary public key from the instance's authorized keys.
    async fn cleanup_temp_keys(&self) -> Result<(), AmiforgeError>;
}

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Communicator kind.
    pub kind: CommunicatorType,
    /// Host name or address.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Private key material, when key-based.
    pub private_key: Option<String>,
}

/// Establishes communicator sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Makes one connection attempt.
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Communicator>, AmiforgeError>;
}

/// Picks the address to connect to.
///
/// `explicit` wins. Without an interface, the public address is preferred,
/// then the public DNS name, then the private address.
#[must_use]
pub fn host_for(instance: &Instance, interface: Option<SshInterface>, explicit: &str) -> Option<String> {
    if !explicit.is_empty() {
        return Some(explicit.to_string());
    }
    match interface {
        Some(SshInterface::PublicIp) => instance.public_ip.clone(),
        Some(SshInterface::PrivateIp) => instance.private_ip.clone(),
        Some(SshInterface::PublicDns) => instance.public_dns.clone(),
        Some(SshInterface::PrivateDns) => instance.private_dns.clone(),
        Some(SshInterface::SessionManager) => Some("localhost".to_string()),
        None => instance
            .public_ip
            .clone()
            .or_else(|| instance.public_dns.clone())
            .or_else(|| instance.private_ip.clone()),
    }
    .filter(|host| !host.is_empty())
}

/// Connects the communicator, retrying until its timeout.
///
/// Publishes `communicator`, `ssh_host` and `ssh_port`. A `none`
/// communicator is skipped.
pub struct Connect {
    config: CommunicatorConfig,
    connector: Option<Arc<dyn Connector>>,
}

impl fmt::Debug for Connect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connect")
            .field("kind", &self.config.kind)
            .field("has_connector", &self.connector.is_some())
            .finish()
    }
}

impl Connect {
    /// Creates the step.
    #[must_use]
    pub fn new(config: CommunicatorConfig, connector: Option<Arc<dyn Connector>>) -> Self {
        Self { config, connector }
    }

    fn target(&self, state: &StateBag) -> Result<ConnectTarget, AmiforgeError> {
        let host = match state.get_ok(SSH_HOST) {
            Some(host) => host,
            None => {
                let instance = state.get(INSTANCE)?;
                host_for(&instance, self.config.interface, &self.config.host).ok_or_else(|| {
                    AmiforgeError::step(format!("instance {} has no address to connect to", instance.id))
                })?
            }
        };
        Ok(ConnectTarget {
            kind: self.config.kind,
            host,
            port: state.get_ok(SSH_PORT).unwrap_or_else(|| self.config.port()),
            username: self.config.username.clone(),
            private_key: state.get_ok(PRIVATE_KEY),
        })
    }
}

#[async_trait]
impl Step for Connect {
    fn name(&self) -> &str {
        "connect"
    }

    async fn run(&self, cancel: &CancellationToken, state: &StateBag) -> StepAction {
        if self.config.kind == CommunicatorType::None {
            info!("Communicator disabled, not connecting");
            return StepAction::Continue;
        }
        let Some(connector) = &self.connector else {
            return halt(
                state,
                AmiforgeError::step(format!("no connector available for {:?}", self.config.kind)),
            );
        };
        let target = try_step!(state, self.target(state));

        ui(state).say(&format!("Waiting for {:?} to become available...", self.config.kind));
        let deadline = Instant::now() + self.config.timeout();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match connector.connect(&target).await {
                Ok(communicator) => {
                    info!(host = %target.host, port = target.port, attempt, "Connected");
                    ui(state).say(&format!("Connected to {}", target.host));
                    state.put(COMMUNICATOR, communicator);
                    state.put(SSH_HOST, target.host);
                    state.put(SSH_PORT, target.port);
                    return StepAction::Continue;
                }
                Err(err) => {
                    if Instant::now() + RETRY_INTERVAL > deadline {
                        return halt(
                            state,
                            AmiforgeError::step(format!(
                                "timeout waiting for {:?} to {}:{}: {err}",
                                self.config.kind, target.host, target.port
                            )),
                        );
                    }
                    debug!(host = %target.host, attempt, error = %err, "Connection attempt failed");
                }
            }
            if let Err(cancelled) = cancel.sleep(RETRY_INTERVAL).await {
                return halt(state, cancelled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::InstanceState;

    fn instance() -> Instance {
        Instance {
            id: "i-1".to_string(),
            state: InstanceState::Running,
            image_id: "ami-1".to_string(),
            public_ip: None,
            private_ip: Some("10.0.0.5".to_string()),
            public_dns: Some("ec2-1.compute.amazonaws.com".to_string()),
            private_dns: None,
            availability_zone: "us-east-1a".to_string(),
            root_device_type: "ebs".to_string(),
            block_devices: Vec::new(),
            spot_request_id: None,
        }
    }

    #[test]
    fn test_host_selection() {
        let i = instance();
        assert_eq!(host_for(&i, None, "").as_deref(), Some("ec2-1.compute.amazonaws.com"));
        assert_eq!(host_for(&i, Some(SshInterface::PrivateIp), "").as_deref(), Some("10.0.0.5"));
        assert_eq!(host_for(&i, Some(SshInterface::PublicIp), ""), None);
        assert_eq!(host_for(&i, Some(SshInterface::PublicIp), "bastion").as_deref(), Some("bastion"));
        assert_eq!(
            host_for(&i, Some(SshInterface::SessionManager), "").as_deref(),
            Some("localhost")
        );
    }
}
