//! # formplug-core
//!
//! Core types, traits, and abstractions for the formplug plugin job engine.
//!
//! This crate provides the foundational data structures and trait definitions
//! that the storage layer, the executor and the worker binary depend on.

pub mod defaults;
pub mod error;
pub mod events;
pub mod models;
pub mod traits;
pub mod uuid_utils;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{BroadcastEventBus, EventBus, EventEnvelope, PluginEvent, RecordingEventBus};
pub use models::*;
pub use traits::*;
pub use uuid_utils::{new_v7, short_id};
