//! Observability utilities.
//!
//! - [`Ui`]: the operator-facing progress stream
//! - [`SecretFilter`]: per-run masking of credentials in that stream
//! - [`init_tracing`]: subscriber setup for embedding binaries

mod secrets;
mod subscriber;
mod ui;

pub use secrets::{SecretFilter, REDACTED};
pub use subscriber::{init_tracing, LogFormat};
pub use ui::{LoggingUi, NoOpUi, RedactingUi, Ui};
