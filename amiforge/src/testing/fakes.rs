//! Recording stand-ins for the UI, communicator, hook, tunnel and steps.

use crate::cancellation::CancellationToken;
use crate::context::StateBag;
use crate::core::StepAction;
use crate::errors::AmiforgeError;
use crate::observability::Ui;
use crate::steps::{halt, Communicator, ConnectTarget, Connector, Hook, Step, Tunnel, TunnelOpener};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A UI that keeps every line as `"<kind>: <text>"`.
#[derive(Debug, Default)]
pub struct CollectingUi {
    lines: Mutex<Vec<String>>,
}

impl CollectingUi {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every line so far.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// True if any line contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.contains(needle))
    }

    fn push(&self, kind: &str, message: &str) {
        self.lines.lock().push(format!("{kind}: {message}"));
    }
}

impl Ui for CollectingUi {
    fn say(&self, message: &str) {
        self.push("say", message);
    }

    fn message(&self, message: &str) {
        self.push("message", message);
    }

    fn error(&self, message: &str) {
        self.push("error", message);
    }
}

/// A communicator that counts temporary-key cleanups.
#[derive(Debug, Default)]
pub struct FakeCommunicator {
    cleanups: AtomicUsize,
}

impl FakeCommunicator {
    /// Number of `cleanup_temp_keys` calls.
    #[must_use]
    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Communicator for FakeCommunicator {
    async fn cleanup_temp_keys(&self) -> Result<(), AmiforgeError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A connector that refuses the first `failures` attempts.
#[derive(Debug, Default)]
pub struct FakeConnector {
    failures: usize,
    targets: Mutex<Vec<ConnectTarget>>,
    communicator: Arc<FakeCommunicator>,
}

impl FakeConnector {
    /// Creates a connector that succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses this many attempts first.
    #[must_use]
    pub fn with_failures(mut self, failures: usize) -> Self {
        self.failures = failures;
        self
    }

    /// Every target tried, in order.
    #[must_use]
    pub fn targets(&self) -> Vec<ConnectTarget> {
        self.targets.lock().clone()
    }

    /// The communicator handed out on success.
    #[must_use]
    pub fn communicator(&self) -> Arc<FakeCommunicator> {
        self.communicator.clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Communicator>, AmiforgeError> {
        let attempt = {
            let mut targets = self.targets.lock();
            targets.push(target.clone());
            targets.len()
        };
        if attempt <= self.failures {
            return Err(AmiforgeError::step(format!(
                "connection refused by {}:{}",
                target.host, target.port
            )));
        }
        Ok(self.communicator.clone())
    }
}

/// A hook that records the events it saw.
#[derive(Debug, Default)]
pub struct RecordingHook {
    events: Mutex<Vec<(String, bool)>>,
    error: Option<String>,
}

impl RecordingHook {
    /// Creates a hook that succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every event with `message`.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// `(event, had_communicator)` for each call.
    #[must_use]
    pub fn events(&self) -> Vec<(String, bool)> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Hook for RecordingHook {
    async fn run(
        &self,
        _cancel: &CancellationToken,
        event: &str,
        communicator: Option<Arc<dyn Communicator>>,
    ) -> Result<(), AmiforgeError> {
        self.events.lock().push((event.to_string(), communicator.is_some()));
        match &self.error {
            Some(message) => Err(AmiforgeError::step(message.clone())),
            None => Ok(()),
        }
    }
}

/// A tunnel that reports its port.
#[derive(Debug)]
pub struct FakeTunnel {
    port: u16,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Tunnel for FakeTunnel {
    fn local_port(&self) -> u16 {
        self.port
    }

    async fn close(&self) -> Result<(), AmiforgeError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens [`FakeTunnel`]s, picking port 8022 when asked for `0`.
#[derive(Debug, Default)]
pub struct FakeTunnelOpener {
    opened: Mutex<Vec<(String, u16, u16)>>,
    closed: Arc<AtomicUsize>,
}

impl FakeTunnelOpener {
    /// `(instance, local, remote)` for each tunnel opened.
    #[must_use]
    pub fn opened(&self) -> Vec<(String, u16, u16)> {
        self.opened.lock().clone()
    }

    /// Number of tunnels closed.
    #[must_use]
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelOpener for FakeTunnelOpener {
    async fn open(
        &self,
        instance_id: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Box<dyn Tunnel>, AmiforgeError> {
        let port = if local_port == 0 { 8022 } else { local_port };
        self.opened
            .lock()
            .push((instance_id.to_string(), local_port, remote_port));
        Ok(Box::new(FakeTunnel {
            port,
            closed: self.closed.clone(),
        }))
    }
}

/// What a [`RecordingStep`] does when run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StepBehavior {
    /// Continue.
    #[default]
    Continue,
    /// Halt with this error message.
    Halt(String),
    /// Panic with this message.
    Panic(String),
    /// Sleep, cancellably, before continuing.
    Wait(Duration),
}

/// A step that appends `run:<name>` and `cleanup:<name>` to a shared journal.
#[derive(Debug)]
pub struct RecordingStep {
    name: String,
    behavior: StepBehavior,
    panic_in_cleanup: bool,
    journal: Arc<Mutex<Vec<String>>>,
}

impl RecordingStep {
    /// Creates a step that continues.
    #[must_use]
    pub fn new(name: impl Into<String>, journal: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.into(),
            behavior: StepBehavior::Continue,
            panic_in_cleanup: false,
            journal,
        }
    }

    /// Sets what `run` does.
    #[must_use]
    pub fn with_behavior(mut self, behavior: StepBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Makes `cleanup` panic after recording itself.
    #[must_use]
    pub fn with_cleanup_panic(mut self) -> Self {
        self.panic_in_cleanup = true;
        self
    }
}

#[async_trait]
impl Step for RecordingStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cancel: &CancellationToken, state: &StateBag) -> StepAction {
        self.journal.lock().push(format!("run:{}", self.name));
        match &self.behavior {
            StepBehavior::Continue => StepAction::Continue,
            StepBehavior::Halt(message) => halt(state, AmiforgeError::step(message.clone())),
            StepBehavior::Panic(message) => panic!("{message}"),
            StepBehavior::Wait(duration) => match cancel.sleep(*duration).await {
                Ok(()) => StepAction::Continue,
                Err(err) => halt(state, err),
            },
        }
    }

    async fn cleanup(&self, _state: &StateBag) {
        self.journal.lock().push(format!("cleanup:{}", self.name));
        assert!(!self.panic_in_cleanup, "cleanup of {} failed", self.name);
    }
}
