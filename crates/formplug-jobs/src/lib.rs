//! # formplug-jobs
//!
//! Persistent plugin job executor for formplug.
//!
//! This crate provides:
//! - Scheduling and asynchronous dispatch of plugin jobs
//! - Retry with exponential backoff and a bounded attempt count
//! - Crash recovery of jobs left `running` by a previous process
//! - An explicit plugin registry validated at registration
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use formplug_jobs::{CreateJobRequest, ExecutorConfig, JobExecutor, NoOpHandler, PluginRegistry};
//! use formplug_db::MemoryStore;
//!
//! let store = MemoryStore::arc();
//! let registry = PluginRegistry::new().with_handler(NoOpHandler::new("noop"))?;
//!
//! let executor = JobExecutor::builder(store.clone(), store.clone())
//!     .with_config(ExecutorConfig::from_env())
//!     .with_registry(registry)
//!     .build();
//!
//! executor.initialize().await?;
//! let job = executor
//!     .create_job(CreateJobRequest::new(plugin_config_id, "response.submitted"))
//!     .await?;
//!
//! // On SIGTERM
//! executor.graceful_shutdown().await?;
//! ```

pub mod executor;
pub mod handler;
pub mod registry;
pub mod retry;

// Re-export core types
pub use formplug_core::*;

pub use executor::{ExecutorBuilder, ExecutorConfig, InitializeReport, JobExecutor};
pub use handler::{ExecuteRequest, FnHandler, NoOpHandler, PluginContext, PluginHandler, PluginOutcome};
pub use registry::{HandlerDescriptor, PluginRegistry};
pub use retry::RetryPolicy;
