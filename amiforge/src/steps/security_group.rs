//! Security groups attached to the instance.

use super::{ec2, halt, try_step, ui, Step};
use crate::cancellation::CancellationToken;
use crate::cloud::Filter;
use crate::config::{to_filters, SecurityGroupFilter};
use crate::context::keys::{SECURITY_GROUP_IDS, VPC_ID};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use crate::pipeline::RetryConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Publishes `security_group_ids`.
///
/// Explicit ids win, then `security_group_filter`. Otherwise a temporary
/// group opening the communicator port is created and deleted on cleanup.
#[derive(Debug, Default)]
pub struct SecurityGroupStep {
    security_group_ids: Vec<String>,
    filter: SecurityGroupFilter,
    port: u16,
    source_cidrs: Vec<String>,
    skip_ingress_rule: bool,
    created: Mutex<Option<String>>,
}

impl SecurityGroupStep {
    /// Creates the step opening `port` on a temporary group.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Uses existing groups.
    #[must_use]
    pub fn with_group_ids(mut self, ids: Vec<String>) -> Self {
        self.security_group_ids = ids;
        self
    }

    /// Looks groups up by filter.
    #[must_use]
    pub fn with_filter(mut self, filter: SecurityGroupFilter) -> Self {
        self.filter = filter;
        self
    }

    /// CIDRs allowed to reach the port; defaults to `0.0.0.0/0`.
    #[must_use]
    pub fn with_source_cidrs(mut self, cidrs: Vec<String>) -> Self {
        self.source_cidrs = cidrs;
        self
    }

    /// Skips the ingress rule (Session Manager tunnels need none).
    #[must_use]
    pub const fn with_skip_ingress_rule(mut self, skip: bool) -> Self {
        self.skip_ingress_rule = skip;
        self
    }

    fn cidrs(&self) -> Vec<String> {
        if self.source_cidrs.is_empty() {
            vec!["0.0.0.0/0".to_string()]
        } else {
            self.source_cidrs.clone()
        }
    }
}

#[async_trait]
impl Step for SecurityGroupStep {
    fn name(&self) -> &str {
        "security_group"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &StateBag) -> StepAction {
        if !self.security_group_ids.is_empty() {
            info!(groups = ?self.security_group_ids, "Using specified security groups");
            state.put(SECURITY_GROUP_IDS, self.security_group_ids.clone());
            return StepAction::Continue;
        }

        let ec2 = try_step!(state, ec2(state));
        let vpc_id = state.get_ok(VPC_ID);

        if !self.filter.filters.is_empty() {
            let mut filters = to_filters(&self.filter.filters);
            if let Some(vpc) = &vpc_id {
                filters.push(Filter::new("vpc-id", vpc.clone()));
            }
            let groups = try_step!(state, ec2.describe_security_groups(&filters).await);
            if groups.is_empty() {
                return halt(
                    state,
                    AmiforgeError::step("no security groups found matching security_group_filter"),
                );
            }
            let ids: Vec<String> = groups.into_iter().map(|g| g.id).collect();
            info!(groups = ?ids, "Found security groups by filter");
            state.put(SECURITY_GROUP_IDS, ids);
            return StepAction::Continue;
        }

        let name = format!("packer_{}", Uuid::new_v4());
        ui(state).say("Creating temporary security group for this instance...");
        let group_id = match ec2
            .create_security_group(&name, "Temporary group for Packer", vpc_id.as_deref())
            .await
        {
            Ok(id) => id,
            Err(err) => {
                return halt(
                    state,
                    AmiforgeError::step(format!("error creating temporary security group: {err}")),
                )
            }
        };
        *self.created.lock() = Some(group_id.clone());
        state.put(SECURITY_GROUP_IDS, vec![group_id.clone()]);

        if !self.skip_ingress_rule {
            let cidrs = self.cidrs();
            ui(state).say(&format!(
                "Authorizing access to port {} from {:?} in the temporary security group...",
                self.port, cidrs
            ));
            if let Err(err) = ec2.authorize_ingress(&group_id, self.port, &cidrs).await {
                return halt(
                    state,
                    AmiforgeError::step(format!(
                        "error authorizing temporary security group {group_id}: {err}"
                    )),
                );
            }
        }

        StepAction::Continue
    }

    async fn cleanup(&self, state: &StateBag) {
        let Some(group_id) = self.created.lock().take() else {
            return;
        };
        let Ok(ec2) = ec2(state) else {
            return;
        };

        ui(state).say("Deleting temporary security group...");
        // The group stays in use until the instance is fully terminated.
        let result = RetryConfig::default()
            .with_tries(11)
            .run_if(
                &CancellationToken::new(),
                "DeleteSecurityGroup",
                |err: &crate::errors::CloudError| err.is_dependency_violation(),
                || ec2.delete_security_group(&group_id),
            )
            .await;

        if let Err(err) = result {
            warn!(group_id = %group_id, error = %err, "Failed to delete temporary security group");
            ui(state).error(&format!(
                "Error cleaning up security group. Please delete the group manually: {group_id}"
            ));
        }
    }
}
