//! Step outcome and run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The outcome of a step's `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Proceed to the next step.
    Continue,
    /// Stop forward progress and unwind.
    Halt,
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Halt => write!(f, "halt"),
        }
    }
}

/// The state of one pipeline run.
///
/// `NotStarted -> Running(i) -> {Succeeded | Halted | Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No step has started.
    #[default]
    NotStarted,
    /// The step at this index is executing.
    Running(usize),
    /// Every step continued.
    Succeeded,
    /// A step halted.
    Halted,
    /// The caller cancelled the run.
    Cancelled,
}

impl RunStatus {
    /// Returns true if the run reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Halted | Self::Cancelled)
    }

    /// Returns true if the run completed every step.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running(i) => write!(f, "running({i})"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Halted => write!(f, "halted"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::NotStarted.is_terminal());
        assert!(!RunStatus::Running(3).is_terminal());
        assert!(RunStatus::Halted.is_terminal());
        assert!(RunStatus::Succeeded.is_success());
        assert!(!RunStatus::Cancelled.is_success());
    }

    #[test]
    fn test_display() {
        assert_eq!(RunStatus::Running(2).to_string(), "running(2)");
        assert_eq!(StepAction::Halt.to_string(), "halt");
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&StepAction::Continue).unwrap();
        assert_eq!(json, "\"continue\"");
        let status: RunStatus = serde_json::from_str("\"halted\"").unwrap();
        assert_eq!(status, RunStatus::Halted);
    }
}
