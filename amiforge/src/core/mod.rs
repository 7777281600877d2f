//! Core domain model types for amiforge.
//!
//! This module contains:
//! - The step outcome and run status enums
//! - The build [`Artifact`] and its builder ids

mod artifact;
mod status;

pub use artifact::{
    Artifact, ArtifactResources, EBS_BUILDER_ID, EBS_VOLUME_BUILDER_ID, IMPORT_BUILDER_ID,
};
pub use status::{RunStatus, StepAction};
