//! In-memory fakes for exercising steps and builders without AWS.
//!
//! This module provides:
//! - [`FakeCloud`], implementing the EC2, S3 and IAM ports
//! - Recording stand-ins for the UI, communicator, hook, tunnel and steps
//! - [`TestState`], a state bag wired to a fake cloud

mod fake_cloud;
mod fakes;
mod fixtures;

pub use fake_cloud::{Call, FakeClient, FakeCloud};
pub use fakes::{
    CollectingUi, FakeCommunicator, FakeConnector, FakeTunnel, FakeTunnelOpener, RecordingHook,
    RecordingStep, StepBehavior,
};
pub use fixtures::TestState;
