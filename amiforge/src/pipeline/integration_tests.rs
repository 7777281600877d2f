//! Runner behaviour across whole step sequences.

#[cfg(test)]
mod tests {
    use crate::cancellation::CancellationToken;
    use crate::context::keys::{CANCELLED, ERROR, HALTED};
    use crate::context::StateBag;
    use crate::core::{RunStatus, StepAction};
    use crate::errors::AmiforgeError;
    use crate::pipeline::StepRunner;
    use crate::steps::{halt, Step};
    use crate::testing::{RecordingStep, StepBehavior};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    type Journal = Arc<Mutex<Vec<String>>>;

    fn runner(journal: &Journal, steps: Vec<(&str, StepBehavior)>) -> StepRunner {
        StepRunner::new(
            steps
                .into_iter()
                .map(|(name, behavior)| {
                    Arc::new(RecordingStep::new(name, journal.clone()).with_behavior(behavior))
                        as Arc<dyn Step>
                })
                .collect(),
        )
    }

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().clone()
    }

    #[tokio::test]
    async fn test_successful_run_cleans_up_in_reverse() {
        let journal = Journal::default();
        let runner = runner(
            &journal,
            vec![
                ("source", StepBehavior::Continue),
                ("launch", StepBehavior::Continue),
                ("create_ami", StepBehavior::Continue),
            ],
        );
        let state = StateBag::new();

        let report = runner.run(&CancellationToken::new(), &state).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert!(report.is_success());
        assert_eq!(report.ran, vec!["source", "launch", "create_ami"]);
        assert_eq!(
            entries(&journal),
            vec![
                "run:source",
                "run:launch",
                "run:create_ami",
                "cleanup:create_ami",
                "cleanup:launch",
                "cleanup:source",
            ]
        );
        assert!(!state.contains(HALTED));
        assert!(!state.contains(ERROR));
        assert_eq!(runner.status(), RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_halt_skips_later_steps_and_cleans_up_the_halting_one() {
        let journal = Journal::default();
        let runner = runner(
            &journal,
            vec![
                ("source", StepBehavior::Continue),
                ("launch", StepBehavior::Halt("no capacity".into())),
                ("create_ami", StepBehavior::Continue),
            ],
        );
        let state = StateBag::new();

        let report = runner.run(&CancellationToken::new(), &state).await;

        assert_eq!(report.status, RunStatus::Halted);
        assert_eq!(report.ran, vec!["source", "launch"]);
        assert_eq!(
            entries(&journal),
            vec!["run:source", "run:launch", "cleanup:launch", "cleanup:source"]
        );
        assert_eq!(state.get_ok(HALTED), Some(true));
        assert!(!state.contains(CANCELLED));
        assert_eq!(state.get(ERROR).unwrap().to_string(), "no capacity");
    }

    #[tokio::test]
    async fn test_panicking_step_halts_and_is_cleaned_up() {
        let journal = Journal::default();
        let runner = runner(
            &journal,
            vec![
                ("source", StepBehavior::Continue),
                ("provision", StepBehavior::Panic("provisioner exploded".into())),
                ("create_ami", StepBehavior::Continue),
            ],
        );
        let state = StateBag::new();

        let report = runner.run(&CancellationToken::new(), &state).await;

        assert_eq!(report.status, RunStatus::Halted);
        assert_eq!(
            entries(&journal),
            vec!["run:source", "run:provision", "cleanup:provision", "cleanup:source"]
        );
        let err = state.get(ERROR).unwrap().to_string();
        assert!(err.contains("provision panicked"), "{err}");
        assert!(err.contains("provisioner exploded"), "{err}");
    }

    #[tokio::test]
    async fn test_cleanup_panic_does_not_stop_the_cascade() {
        let journal = Journal::default();
        let steps: Vec<Arc<dyn Step>> = vec![
            Arc::new(RecordingStep::new("source", journal.clone())),
            Arc::new(RecordingStep::new("launch", journal.clone()).with_cleanup_panic()),
            Arc::new(RecordingStep::new("create_ami", journal.clone())),
        ];
        let runner = StepRunner::new(steps);

        let report = runner.run(&CancellationToken::new(), &StateBag::new()).await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(
            entries(&journal)[3..].to_vec(),
            vec!["cleanup:create_ami", "cleanup:launch", "cleanup:source"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_a_waiting_step() {
        let journal = Journal::default();
        let runner = runner(
            &journal,
            vec![
                ("launch", StepBehavior::Continue),
                ("wait_for_ami", StepBehavior::Wait(Duration::from_secs(3600))),
                ("copy", StepBehavior::Continue),
            ],
        );
        let cancel = Arc::new(CancellationToken::new());
        let state = StateBag::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel("interrupted by user");
        });

        let started = tokio::time::Instant::now();
        let report = runner.run(&cancel, &state).await;

        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.ran, vec!["launch", "wait_for_ami"]);
        assert_eq!(
            entries(&journal),
            vec![
                "run:launch",
                "run:wait_for_ami",
                "cleanup:wait_for_ami",
                "cleanup:launch",
            ]
        );
        assert_eq!(state.get_ok(CANCELLED), Some(true));
        assert!(state.get(ERROR).unwrap().is_cancelled());
    }

    /// Reports an interrupted wait as its own failure, as the EC2 steps do.
    #[derive(Debug)]
    struct WaitForImage;

    #[async_trait]
    impl Step for WaitForImage {
        fn name(&self) -> &str {
            "wait_for_image"
        }

        async fn run(&self, cancel: &CancellationToken, state: &StateBag) -> StepAction {
            match cancel.sleep(Duration::from_secs(3600)).await {
                Ok(()) => StepAction::Continue,
                Err(err) => halt(
                    state,
                    AmiforgeError::step(format!("error waiting for AMI ami-1: {err}")),
                ),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_replaces_a_wrapped_step_error() {
        let runner = StepRunner::new(vec![Arc::new(WaitForImage) as Arc<dyn Step>]);
        let cancel = Arc::new(CancellationToken::new());
        let state = StateBag::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel("ctrl-c");
        });
        let report = runner.run(&cancel, &state).await;

        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(state.get_ok(HALTED), Some(true));
        assert!(matches!(
            state.get(ERROR).unwrap(),
            AmiforgeError::Cancelled(reason) if reason == "ctrl-c"
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_start_runs_nothing() {
        let journal = Journal::default();
        let runner = runner(&journal, vec![("source", StepBehavior::Continue)]);
        let cancel = CancellationToken::new();
        cancel.cancel("shutdown");
        let state = StateBag::new();

        let report = runner.run(&cancel, &state).await;

        assert_eq!(report.status, RunStatus::Cancelled);
        assert!(report.ran.is_empty());
        assert!(entries(&journal).is_empty());
        assert!(matches!(
            state.get(ERROR).unwrap(),
            AmiforgeError::Cancelled(reason) if reason == "shutdown"
        ));
    }

    #[tokio::test]
    async fn test_first_error_is_kept() {
        let state = StateBag::new();

        assert_eq!(halt(&state, AmiforgeError::step("first")), StepAction::Halt);
        assert_eq!(halt(&state, AmiforgeError::step("second")), StepAction::Halt);

        assert_eq!(state.get(ERROR).unwrap().to_string(), "first");
    }

    #[test]
    fn test_step_names_in_order() {
        let journal = Journal::default();
        let runner = runner(
            &journal,
            vec![("a", StepBehavior::Continue), ("b", StepBehavior::Continue)],
        );
        assert_eq!(runner.step_names(), vec!["a", "b"]);
        assert_eq!(runner.status(), RunStatus::NotStarted);
    }
}
