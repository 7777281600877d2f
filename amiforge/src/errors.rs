//! Error types for amiforge.
//!
//! Every error that can end a build is representable as [`AmiforgeError`].
//! The type is `Clone` so a step can publish it into the state bag under the
//! well-known `"error"` key and the caller can still read it after the
//! cleanup cascade has finished.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::cancellation::Cancelled;
use crate::config::TemplateError;
use crate::pipeline::WaitError;

/// The main error type for builds and post-processing runs.
#[derive(Debug, Clone, Error)]
pub enum AmiforgeError {
    /// Configuration was rejected before any remote call was made.
    #[error("{0}")]
    Config(#[from] ConfigErrors),

    /// A remote call failed (after any retries).
    #[error("{0}")]
    Cloud(#[from] CloudError),

    /// A required state-bag value was missing or had the wrong type.
    #[error("{0}")]
    State(#[from] StateError),

    /// A waiter gave up or observed a terminal failure.
    #[error("{0}")]
    Wait(#[from] WaitError),

    /// The run was cancelled by the caller.
    #[error("build cancelled: {0}")]
    Cancelled(String),

    /// A name or key template could not be rendered.
    #[error("{0}")]
    Template(#[from] TemplateError),

    /// A step failed with a descriptive message naming the resource involved.
    #[error("{0}")]
    Step(String),

    /// A local I/O failure (opening the image file to upload, key files).
    #[error("IO error: {0}")]
    Io(String),
}

impl AmiforgeError {
    /// Creates a step error from any displayable message.
    #[must_use]
    pub fn step(message: impl Into<String>) -> Self {
        Self::Step(message.into())
    }

    /// Returns true if this error represents a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::Wait(WaitError::Cancelled(_)))
    }
}

impl From<Cancelled> for AmiforgeError {
    fn from(err: Cancelled) -> Self {
        Self::Cancelled(err.reason)
    }
}

impl From<std::io::Error> for AmiforgeError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Error returned by a remote EC2/S3/IAM call.
///
/// The `code` mirrors the service error code (`InvalidAMIID.NotFound`,
/// `DependencyViolation`, `RequestLimitExceeded`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{operation} failed: {code}: {message}")]
pub struct CloudError {
    /// The remote operation (e.g. `ImportImage`).
    pub operation: String,
    /// The service error code.
    pub code: String,
    /// The human-readable message returned by the service.
    pub message: String,
}

impl CloudError {
    /// Creates a new cloud error.
    #[must_use]
    pub fn new(
        operation: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation: operation.into(),
            code: code.into(),
            message: message.into(),
        }
    }

    /// Returns true for `*.NotFound` style codes.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code.ends_with("NotFound") || self.code == "NoSuchEntity" || self.code == "NoSuchKey"
    }

    /// Returns true if the resource is still referenced by another resource.
    #[must_use]
    pub fn is_dependency_violation(&self) -> bool {
        self.code == "DependencyViolation"
    }

    /// Returns true for throttling and transient service failures.
    #[must_use]
    pub fn is_throttling(&self) -> bool {
        matches!(
            self.code.as_str(),
            "RequestLimitExceeded" | "Throttling" | "ThrottlingException" | "ServiceUnavailable"
                | "InternalError"
        )
    }
}

/// Error raised when a state-bag lookup fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// No value was published under the key.
    #[error("state key '{key}' is not set")]
    Missing {
        /// The key that was read.
        key: String,
    },

    /// A value exists but was published with a different type.
    #[error("state key '{key}' does not hold a value of type {expected}")]
    TypeMismatch {
        /// The key that was read.
        key: String,
        /// The requested Rust type.
        expected: &'static str,
    },
}

/// A single configuration problem.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    /// Creates a configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Every configuration problem found in one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigErrors {
    /// The collected errors, in discovery order.
    pub errors: Vec<ConfigError>,
}

impl ConfigErrors {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one more problem.
    pub fn push(&mut self, message: impl Into<String>) {
        self.errors.push(ConfigError::new(message));
    }

    /// Appends all problems from another pass.
    pub fn extend(&mut self, other: Self) {
        self.errors.extend(other.errors);
    }

    /// Appends the problems from a sub-config `prepare` result.
    pub fn merge(&mut self, result: Result<(), Self>) {
        if let Err(other) = result {
            self.extend(other);
        }
    }

    /// Returns true if no problems were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of recorded problems.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns true if any recorded message contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.errors.iter().any(|e| e.0.contains(needle))
    }

    /// Converts the collection into a `Result`, failing if anything was recorded.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let noun = if self.errors.len() == 1 { "error" } else { "errors" };
        write!(f, "{} {} occurred:", self.errors.len(), noun)?;
        for err in &self.errors {
            write!(f, "\n* {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigErrors {}

/// Result alias used across the crate.
pub type Result<T, E = AmiforgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_aggregate_display() {
        let mut errs = ConfigErrors::new();
        errs.push("ami_name must be specified");
        errs.push("invalid format 'iso'");

        let text = errs.to_string();
        assert!(text.starts_with("2 errors occurred:"));
        assert!(text.contains("* ami_name must be specified"));
        assert!(text.contains("* invalid format 'iso'"));
    }

    #[test]
    fn test_config_errors_into_result() {
        assert!(ConfigErrors::new().into_result().is_ok());

        let mut errs = ConfigErrors::new();
        errs.push("boom");
        let err = errs.into_result().unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err.contains("boom"));
    }

    #[test]
    fn test_cloud_error_classification() {
        let not_found = CloudError::new("DescribeImages", "InvalidAMIID.NotFound", "gone");
        assert!(not_found.is_not_found());
        assert!(!not_found.is_throttling());

        let dep = CloudError::new("DeleteSecurityGroup", "DependencyViolation", "in use");
        assert!(dep.is_dependency_violation());

        let throttled = CloudError::new("ImportImage", "RequestLimitExceeded", "slow down");
        assert!(throttled.is_throttling());
        assert_eq!(
            throttled.to_string(),
            "ImportImage failed: RequestLimitExceeded: slow down"
        );
    }

    #[test]
    fn test_cancelled_conversion() {
        let err: AmiforgeError = Cancelled::new("user interrupt").into();
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("user interrupt"));
    }

    #[test]
    fn test_state_error_display() {
        let err = StateError::Missing { key: "instance_id".to_string() };
        assert_eq!(err.to_string(), "state key 'instance_id' is not set");
    }
}
