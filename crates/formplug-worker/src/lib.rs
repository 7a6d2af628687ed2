//! # formplug-worker
//!
//! Host process for the plugin job executor: built-in plugins, event
//! telemetry and process settings. The binary in `main.rs` wires them up.

pub mod settings;
pub mod telemetry;
pub mod webhook;

pub use settings::WorkerSettings;
pub use telemetry::telemetry_mirror;
pub use webhook::{sign_payload, WebhookPlugin};
