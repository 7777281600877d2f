//! Builder and post-processor configuration.
//!
//! Every block is a plain serde struct with `#[serde(default)]`. Decoding is
//! left to the caller; `prepare` applies defaults and collects every
//! validation problem into one [`ConfigErrors`](crate::errors::ConfigErrors)
//! so a user sees them all in one pass.

mod access;
mod ami;
mod attributes;
mod block_device;
mod import;
mod run;
mod template;
mod validate;

pub use access::AccessConfig;
pub use ami::{AmiConfig, DeregistrationProtection};
pub use attributes::ImageAttributes;
pub use block_device::{
    prepare_devices, to_mappings, BlockDevice, ImageMethod, RootBlockDevice,
};
pub use import::{ImportConfig, IMPORT_FORMATS};
pub use run::{
    to_filters, AmiFilter, CommunicatorConfig, CommunicatorType, Placement, RunConfig,
    SecurityGroupFilter, SshInterface, SubnetFilter,
};
pub use template::{RenderContext, TemplateError, GENERATED_DATA_KEYS};
pub use validate::{
    ami_name_errors, clean_resource_name, imds_support_error, is_cidr, validate_kms_key,
    AMI_NAME_MAX, AMI_NAME_MIN, IMDS_V2,
};
