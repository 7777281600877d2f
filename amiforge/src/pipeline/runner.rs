//! Sequential step runner with reverse-order cleanup.

use crate::cancellation::CancellationToken;
use crate::context::keys::{CANCELLED, ERROR, HALTED};
use crate::context::StateBag;
use crate::core::{RunStatus, StepAction};
use crate::errors::AmiforgeError;
use crate::steps::{halt, Step};
use futures::FutureExt;
use parking_lot::RwLock;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Terminal status.
    pub status: RunStatus,
    /// Names of the steps whose `run` was entered, in execution order.
    pub ran: Vec<String>,
}

impl RunReport {
    /// Returns true if every step continued.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Runs steps in order, then cleans up every step that ran in reverse order.
///
/// The runner never returns an error. A failing step records it under the
/// `error` key; the runner marks `halted` or `cancelled` before the cleanup
/// cascade so cleanups can tell a failed run from a successful one. A
/// cancelled run always ends with the cancellation under `error`.
pub struct StepRunner {
    steps: Vec<Arc<dyn Step>>,
    status: RwLock<RunStatus>,
}

impl std::fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunner")
            .field("steps", &self.step_names())
            .field("status", &*self.status.read())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl StepRunner {
    /// Creates a runner over `steps`.
    #[must_use]
    pub fn new(steps: Vec<Arc<dyn Step>>) -> Self {
        Self {
            steps,
            status: RwLock::new(RunStatus::NotStarted),
        }
    }

    /// Names of the steps, in order.
    #[must_use]
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name().to_string()).collect()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        *self.status.read()
    }

    /// Runs every step, then the cleanup cascade.
    pub async fn run(&self, cancel: &CancellationToken, state: &StateBag) -> RunReport {
        let started = Instant::now();
        let mut ran: Vec<usize> = Vec::with_capacity(self.steps.len());
        let mut halted = false;

        for (index, step) in self.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            *self.status.write() = RunStatus::Running(index);
            // Recorded before running so a step that fails part way is still cleaned up.
            ran.push(index);

            info!(step = step.name(), index, "Running step");
            let outcome = AssertUnwindSafe(step.run(cancel, state)).catch_unwind().await;
            let action = match outcome {
                Ok(action) => action,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(step = step.name(), panic = %message, "Step panicked");
                    halt(state, AmiforgeError::step(format!("step {} panicked: {message}", step.name())))
                }
            };

            if action == StepAction::Halt {
                halted = true;
                break;
            }
        }

        let cancelled = cancel.is_cancelled();
        if cancelled {
            let reason = cancel.reason().unwrap_or_default();
            warn!(reason = %reason, "Run cancelled");
            state.put(CANCELLED, true);
            // A step interrupted mid-wait may have wrapped the cancellation in its own error.
            match state.get_ok(ERROR) {
                Some(err) if err.is_cancelled() => {}
                Some(err) => {
                    debug!(error = %err, "Replacing step error with the cancellation");
                    state.put(ERROR, AmiforgeError::Cancelled(reason));
                }
                None => state.put(ERROR, AmiforgeError::Cancelled(reason)),
            }
        }
        if halted {
            state.put(HALTED, true);
        }

        self.cleanup(&ran, state).await;

        let status = if cancelled {
            RunStatus::Cancelled
        } else if halted {
            RunStatus::Halted
        } else {
            RunStatus::Succeeded
        };
        *self.status.write() = status;
        info!(
            status = %status,
            steps_run = ran.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Run finished"
        );

        RunReport {
            status,
            ran: ran.iter().map(|&i| self.steps[i].name().to_string()).collect(),
        }
    }

    async fn cleanup(&self, ran: &[usize], state: &StateBag) {
        for &index in ran.iter().rev() {
            let step = &self.steps[index];
            debug!(step = step.name(), "Cleaning up step");
            let outcome = AssertUnwindSafe(step.cleanup(state)).catch_unwind().await;
            if let Err(payload) = outcome {
                error!(
                    step = step.name(),
                    panic = %panic_message(payload.as_ref()),
                    "Step cleanup panicked"
                );
            }
        }
    }
}
