//! # Amiforge
//!
//! Step-driven builders that produce Amazon Machine Images and EBS volumes.
//!
//! A build is an ordered list of steps sharing a typed state bag. Steps run
//! in order until one halts or the run is cancelled; then every step that ran
//! is cleaned up in reverse order, so temporary instances, key pairs,
//! security groups and instance profiles never outlive the build.
//!
//! Amiforge provides:
//!
//! - **Builders**: [`builders::EbsBuilder`] images a provisioned instance and
//!   copies and shares the result; [`builders::EbsVolumeBuilder`] keeps
//!   provisioned data volumes instead
//! - **Import**: [`builders::ImportPostProcessor`] turns a local disk image
//!   into an AMI through S3
//! - **Waiting and retrying**: cancellable waiters whose polling can be tuned
//!   per build or through `AWS_MAX_ATTEMPTS` / `AWS_POLL_DELAY_SECONDS`
//! - **Cloud ports**: traits over EC2, S3 and IAM, with an in-memory
//!   [`testing::FakeCloud`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use amiforge::prelude::*;
//!
//! let config: EbsConfig = serde_json::from_str(&raw)?;
//! let builder = EbsBuilder::new(config)?;
//! let services = BuildServices::new(cloud).with_connector(ssh);
//!
//! if let Some(artifact) = builder.run(&services, &CancellationToken::new()).await? {
//!     println!("{artifact}");
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod builders;
pub mod cancellation;
pub mod cloud;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod observability;
pub mod pipeline;
pub mod steps;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::builders::{
        BuildServices, EbsBuilder, EbsConfig, EbsVolumeBuilder, EbsVolumeConfig,
        ImportPostProcessor,
    };
    pub use crate::cancellation::{CancellationToken, Cancelled};
    pub use crate::cloud::{CloudProvider, Ec2Api, IamApi, S3Api};
    pub use crate::config::{
        AccessConfig, AmiConfig, BlockDevice, CommunicatorConfig, ImportConfig, RenderContext,
        RunConfig,
    };
    pub use crate::context::{StateBag, StateKey};
    pub use crate::core::{Artifact, ArtifactResources, RunStatus, StepAction};
    pub use crate::errors::{AmiforgeError, CloudError, ConfigErrors};
    pub use crate::observability::{init_tracing, LogFormat, LoggingUi, Ui};
    pub use crate::pipeline::{
        Backoff, PollingConfig, RetryConfig, StepRunner, WaitError, WaitOptions,
    };
    pub use crate::steps::{Communicator, Connector, Hook, Step, TunnelOpener};
}
