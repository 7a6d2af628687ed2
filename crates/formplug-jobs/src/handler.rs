//! Plugin handlers and the context they run with.

use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use formplug_core::{FormEvent, Job, JobFailure, JobPayload, PluginConfig, Result};

use crate::executor::JobExecutor;

/// Everything a plugin needs to run one job.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub job_id: Uuid,
    pub plugin_id: String,
    pub plugin_config_id: Uuid,
    pub form_id: Uuid,
    /// Plugin-specific settings from the form's plugin configuration.
    pub config: JsonValue,
    pub payload: JobPayload,
    /// Attempt number of this execution, starting at 1.
    pub attempt: i32,
}

impl ExecuteRequest {
    pub fn new(job: &Job, config: &PluginConfig) -> Self {
        Self {
            job_id: job.id,
            plugin_id: config.plugin_id.clone(),
            plugin_config_id: config.id,
            form_id: config.form_id,
            config: config.config.clone(),
            payload: job.payload.clone(),
            attempt: job.attempts + 1,
        }
    }

    /// Domain event name, e.g. `response.submitted`.
    pub fn event(&self) -> &str {
        &self.payload.event
    }

    /// Decode the payload into a typed form event.
    pub fn form_event(&self) -> Result<FormEvent> {
        FormEvent::from_payload(&self.payload)
    }

    /// Read a string setting from the plugin configuration.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(JsonValue::as_str)
    }
}

/// Result of running a plugin.
#[derive(Debug)]
pub enum PluginOutcome {
    /// The plugin finished; the value is stored as the execution output.
    Success(JsonValue),
    /// The plugin failed; the job takes the retry path.
    Failed(JobFailure),
    /// The plugin took ownership of the context and reports later through
    /// [`PluginContext::complete`] or [`PluginContext::fail`].
    Deferred,
}

impl From<anyhow::Result<JsonValue>> for PluginOutcome {
    fn from(result: anyhow::Result<JsonValue>) -> Self {
        match result {
            Ok(output) => PluginOutcome::Success(output),
            Err(e) => PluginOutcome::Failed(JobFailure::from(e)),
        }
    }
}

/// Context handed to a plugin for one execution.
pub struct PluginContext {
    pub request: ExecuteRequest,
    executor: JobExecutor,
    started: Instant,
}

impl PluginContext {
    pub(crate) fn new(request: ExecuteRequest, executor: JobExecutor, started: Instant) -> Self {
        Self {
            request,
            executor,
            started,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.request.job_id
    }

    /// Milliseconds since the executor picked the job up.
    pub fn elapsed_ms(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    /// Report success for a deferred execution.
    pub async fn complete(self, result: JsonValue) {
        self.executor
            .handle_job_completion(self.request.job_id, result)
            .await;
    }

    /// Report failure for a deferred execution.
    pub async fn fail(self, failure: JobFailure) {
        let elapsed = self.elapsed_ms();
        self.executor
            .handle_job_failure(self.request.job_id, failure, elapsed)
            .await;
    }
}

/// Trait for plugin handlers.
#[async_trait]
pub trait PluginHandler: Send + Sync {
    /// The plugin id this handler serves (e.g. `"webhook"`).
    fn plugin_id(&self) -> &str;

    /// Short human-readable description for registry listings.
    fn description(&self) -> &str {
        ""
    }

    /// Run the plugin for one job.
    async fn execute(&self, ctx: PluginContext) -> PluginOutcome;
}

/// Handler that succeeds immediately with an empty object.
pub struct NoOpHandler {
    plugin_id: String,
}

impl NoOpHandler {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
        }
    }
}

#[async_trait]
impl PluginHandler for NoOpHandler {
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    fn description(&self) -> &str {
        "Does nothing and succeeds"
    }

    async fn execute(&self, _ctx: PluginContext) -> PluginOutcome {
        PluginOutcome::Success(json!({}))
    }
}

/// Handler backed by an async closure over the request.
///
/// ```ignore
/// let handler = FnHandler::new("echo", |req: ExecuteRequest| async move {
///     Ok(serde_json::json!({ "event": req.event() }))
/// });
/// ```
pub struct FnHandler<F> {
    plugin_id: String,
    func: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(ExecuteRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send,
{
    pub fn new(plugin_id: impl Into<String>, func: F) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> PluginHandler for FnHandler<F>
where
    F: Fn(ExecuteRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<JsonValue>> + Send,
{
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    async fn execute(&self, ctx: PluginContext) -> PluginOutcome {
        (self.func)(ctx.request).await.into()
    }
}
