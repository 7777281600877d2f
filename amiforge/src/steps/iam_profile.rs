//! Instance profile attached to the instance.

use super::{halt, try_step, ui, Step};
use crate::cancellation::CancellationToken;
use crate::cloud::IamApi;
use crate::context::keys::{IAM, IAM_INSTANCE_PROFILE};
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::{AmiforgeError, CloudError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const ASSUME_ROLE_POLICY: &str = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Principal":{"Service":"ec2.amazonaws.com"},"Action":"sts:AssumeRole"}]}"#;

#[derive(Debug, Default)]
struct Created {
    profile: Option<String>,
    role: Option<String>,
    policy: bool,
    attached: bool,
}

/// Publishes `iam_instance_profile`.
///
/// An existing profile is validated unless told otherwise. With a policy
/// document, a temporary role and profile are created and removed on cleanup.
#[derive(Debug, Default)]
pub struct IamInstanceProfile {
    profile: String,
    skip_validation: bool,
    temporary_policy: Option<serde_json::Value>,
    created: Mutex<Created>,
}

impl IamInstanceProfile {
    /// Creates the step.
    #[must_use]
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            ..Self::default()
        }
    }

    /// Skips checking that the profile exists.
    #[must_use]
    pub const fn with_skip_validation(mut self, skip: bool) -> Self {
        self.skip_validation = skip;
        self
    }

    /// Creates a temporary profile whose role carries `policy`.
    #[must_use]
    pub fn with_temporary_policy(mut self, policy: Option<serde_json::Value>) -> Self {
        self.temporary_policy = policy;
        self
    }

    async fn create_temporary(
        &self,
        iam: &dyn IamApi,
        policy: &serde_json::Value,
    ) -> Result<String, CloudError> {
        let name = format!("packer-{}", Uuid::new_v4());

        iam.create_instance_profile(&name).await?;
        self.created.lock().profile = Some(name.clone());

        iam.create_role(&name, ASSUME_ROLE_POLICY).await?;
        self.created.lock().role = Some(name.clone());

        iam.put_role_policy(&name, &name, &policy.to_string()).await?;
        self.created.lock().policy = true;

        iam.add_role_to_instance_profile(&name, &name).await?;
        self.created.lock().attached = true;

        Ok(name)
    }
}

#[async_trait]
impl Step for IamInstanceProfile {
    fn name(&self) -> &str {
        "iam_instance_profile"
    }

    async fn run(&self, _cancel: &CancellationToken, state: &StateBag) -> StepAction {
        if !self.profile.is_empty() {
            if !self.skip_validation {
                let iam = try_step!(state, state.get(IAM));
                if let Err(err) = iam.get_instance_profile(&self.profile).await {
                    return halt(
                        state,
                        AmiforgeError::step(format!(
                            "couldn't find specified instance profile {}: {err}",
                            self.profile
                        )),
                    );
                }
            }
            info!(profile = %self.profile, "Using specified instance profile");
            state.put(IAM_INSTANCE_PROFILE, self.profile.clone());
            return StepAction::Continue;
        }

        let Some(policy) = &self.temporary_policy else {
            return StepAction::Continue;
        };

        let iam: Arc<dyn IamApi> = try_step!(state, state.get(IAM));
        ui(state).say("Creating temporary instance profile for this instance...");
        match self.create_temporary(iam.as_ref(), policy).await {
            Ok(name) => {
                info!(profile = %name, "Created temporary instance profile");
                state.put(IAM_INSTANCE_PROFILE, name);
                StepAction::Continue
            }
            Err(err) => halt(
                state,
                AmiforgeError::step(format!("error creating temporary instance profile: {err}")),
            ),
        }
    }

    async fn cleanup(&self, state: &StateBag) {
        let created = std::mem::take(&mut *self.created.lock());
        let Some(profile) = created.profile else {
            return;
        };
        let Ok(iam) = state.get(IAM) else {
            return;
        };

        ui(state).say("Deleting temporary instance profile...");
        let mut failures = Vec::new();

        if let Some(role) = &created.role {
            if created.attached {
                if let Err(err) = iam.remove_role_from_instance_profile(&profile, role).await {
                    failures.push(err);
                }
            }
            if created.policy {
                if let Err(err) = iam.delete_role_policy(role, role).await {
                    failures.push(err);
                }
            }
            if let Err(err) = iam.delete_role(role).await {
                failures.push(err);
            }
        }
        if let Err(err) = iam.delete_instance_profile(&profile).await {
            failures.push(err);
        }

        for err in &failures {
            warn!(profile = %profile, error = %err, "Failed to clean up instance profile");
        }
        if !failures.is_empty() {
            ui(state).error(&format!(
                "Error cleaning up instance profile. Please delete {profile} manually"
            ));
        }
    }
}
