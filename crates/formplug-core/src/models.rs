//! Core data models for formplug.
//!
//! These types are shared across all formplug crates and represent
//! the core domain entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::{Error, Result};

// =============================================================================
// JOB TYPES
// =============================================================================

/// Status of a plugin job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// `completed` and `failed` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Parse the database representation.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Serialization(format!("unknown job status: {other}"))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payload carried by a job: the domain event name and its raw data.
///
/// The executor never looks inside `data`; plugins decode it with
/// [`FormEvent::from_payload`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub event: String,
    #[serde(default)]
    pub data: Map<String, JsonValue>,
}

impl JobPayload {
    pub fn new(event: impl Into<String>, data: Map<String, JsonValue>) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// A scheduled unit of plugin work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub plugin_config_id: Uuid,
    /// Human-readable label. Not guaranteed unique.
    pub job_name: String,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether the job may be executed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for <= now
    }

    /// Milliseconds elapsed since `started_at`, or 0 when the job never started.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        self.started_at
            .map(|s| (now - s).num_milliseconds().max(0))
            .unwrap_or(0)
    }
}

/// Fields for a job about to be persisted.
///
/// Built by the executor from a [`CreateJobRequest`]; the store writes it as-is.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub plugin_config_id: Uuid,
    pub job_name: String,
    pub payload: JobPayload,
    pub max_attempts: i32,
    pub scheduled_for: DateTime<Utc>,
}

/// Request to enqueue a plugin job for a domain event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub plugin_config_id: Uuid,
    pub event: String,
    #[serde(default)]
    pub data: Map<String, JsonValue>,
    /// Earliest execution time. Defaults to now.
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Defaults to [`crate::defaults::JOB_MAX_ATTEMPTS`].
    #[serde(default)]
    pub max_attempts: Option<i32>,
}

impl CreateJobRequest {
    pub fn new(plugin_config_id: Uuid, event: impl Into<String>) -> Self {
        Self {
            plugin_config_id,
            event: event.into(),
            data: Map::new(),
            scheduled_for: None,
            max_attempts: None,
        }
    }

    pub fn with_data(mut self, data: Map<String, JsonValue>) -> Self {
        self.data = data;
        self
    }

    pub fn with_scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Partial update applied to a single job.
///
/// `None` leaves a field untouched. The nested options (`started_at`,
/// `completed_at`, `last_error`) use `Some(None)` to clear the column.
/// When `expected_status` is set the update only applies if the stored status
/// still matches, otherwise the store returns [`Error::Conflict`].
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub expected_status: Option<JobStatus>,
    pub status: Option<JobStatus>,
    pub attempts: Option<i32>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub last_error: Option<Option<String>>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guard the update on the currently stored status.
    pub fn expect(mut self, status: JobStatus) -> Self {
        self.expected_status = Some(status);
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn attempts(mut self, attempts: i32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    pub fn started_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    /// Apply this patch to an in-memory job. Does not check `expected_status`.
    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        if let Some(at) = self.scheduled_for {
            job.scheduled_for = at;
        }
        if let Some(at) = self.started_at {
            job.started_at = at;
        }
        if let Some(at) = self.completed_at {
            job.completed_at = at;
        }
        if let Some(ref err) = self.last_error {
            job.last_error = err.clone();
        }
        job.updated_at = now;
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// Only jobs with `scheduled_for <= due_before`.
    pub due_before: Option<DateTime<Utc>>,
    pub plugin_config_id: Option<Uuid>,
    pub limit: Option<i64>,
}

impl JobFilter {
    /// Pending jobs whose scheduled time has passed.
    pub fn due(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            due_before: Some(now),
            ..Default::default()
        }
    }

    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.due_before.map_or(true, |t| job.scheduled_for <= t)
            && self
                .plugin_config_id
                .map_or(true, |id| job.plugin_config_id == id)
    }
}

// =============================================================================
// EXECUTION LOG TYPES
// =============================================================================

/// Outcome recorded in a [`PluginExecutionLog`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(Error::Serialization(format!(
                "unknown execution status: {other}"
            ))),
        }
    }
}

/// Append-only record of a terminal job outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginExecutionLog {
    pub id: Uuid,
    pub plugin_config_id: Uuid,
    pub job_id: Uuid,
    pub event: String,
    pub status: ExecutionStatus,
    pub executed_at: DateTime<Utc>,
    pub execution_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
}

/// Fields for a new execution log row.
#[derive(Debug, Clone)]
pub struct NewExecutionLog {
    pub plugin_config_id: Uuid,
    pub job_id: Uuid,
    pub event: String,
    pub status: ExecutionStatus,
    pub execution_time_ms: i64,
    pub output_data: Option<JsonValue>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
}

impl NewExecutionLog {
    pub fn success(job: &Job, output: JsonValue, execution_time_ms: i64) -> Self {
        Self {
            plugin_config_id: job.plugin_config_id,
            job_id: job.id,
            event: job.payload.event.clone(),
            status: ExecutionStatus::Success,
            execution_time_ms,
            output_data: Some(output),
            error_message: None,
            error_stack: None,
        }
    }

    pub fn failure(job: &Job, failure: &JobFailure, execution_time_ms: i64) -> Self {
        Self {
            plugin_config_id: job.plugin_config_id,
            job_id: job.id,
            event: job.payload.event.clone(),
            status: ExecutionStatus::Failed,
            execution_time_ms,
            output_data: None,
            error_message: Some(failure.message.clone()),
            error_stack: failure.stack.clone(),
        }
    }
}

/// A failure reported for one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    /// Cause chain or backtrace, when available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<anyhow::Error> for JobFailure {
    fn from(err: anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            stack: Some(format!("{err:?}")),
        }
    }
}

impl From<Error> for JobFailure {
    fn from(err: Error) -> Self {
        Self::new(err.to_string())
    }
}

// =============================================================================
// PLUGIN CONFIGURATION
// =============================================================================

/// Persisted settings enabling one plugin on one form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub id: Uuid,
    pub form_id: Uuid,
    /// Registry key of the plugin (`webhook`, `email`, `quiz-grading`, ...).
    pub plugin_id: String,
    pub enabled: bool,
    pub config: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a plugin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePluginConfigRequest {
    pub form_id: Uuid,
    pub plugin_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: JsonValue,
}

fn default_true() -> bool {
    true
}

// =============================================================================
// FORM EVENTS
// =============================================================================

/// Known domain events, decoded from a [`JobPayload`] at the plugin boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum FormEvent {
    #[serde(rename = "response.submitted")]
    ResponseSubmitted(ResponseEventData),
    #[serde(rename = "response.updated")]
    ResponseUpdated(ResponseEventData),
    #[serde(rename = "response.deleted")]
    ResponseDeleted {
        form_id: Uuid,
        response_id: Uuid,
    },
    #[serde(rename = "form.published")]
    FormPublished(FormEventData),
    #[serde(rename = "form.closed")]
    FormClosed(FormEventData),
}

/// Data carried by response events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEventData {
    pub form_id: Uuid,
    pub response_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respondent_email: Option<String>,
    /// Answers keyed by question id.
    #[serde(default)]
    pub answers: Map<String, JsonValue>,
}

/// Data carried by form lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormEventData {
    pub form_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl FormEvent {
    pub const RESPONSE_SUBMITTED: &'static str = "response.submitted";
    pub const RESPONSE_UPDATED: &'static str = "response.updated";
    pub const RESPONSE_DELETED: &'static str = "response.deleted";
    pub const FORM_PUBLISHED: &'static str = "form.published";
    pub const FORM_CLOSED: &'static str = "form.closed";

    /// Decode a job payload into a typed event.
    pub fn from_payload(payload: &JobPayload) -> Result<Self> {
        let value = serde_json::json!({
            "event": payload.event,
            "data": payload.data,
        });
        serde_json::from_value(value).map_err(|e| {
            Error::InvalidInput(format!("cannot decode event '{}': {e}", payload.event))
        })
    }

    /// Event name as stored in the payload.
    pub fn name(&self) -> &'static str {
        match self {
            FormEvent::ResponseSubmitted(_) => Self::RESPONSE_SUBMITTED,
            FormEvent::ResponseUpdated(_) => Self::RESPONSE_UPDATED,
            FormEvent::ResponseDeleted { .. } => Self::RESPONSE_DELETED,
            FormEvent::FormPublished(_) => Self::FORM_PUBLISHED,
            FormEvent::FormClosed(_) => Self::FORM_CLOSED,
        }
    }

    pub fn form_id(&self) -> Uuid {
        match self {
            FormEvent::ResponseSubmitted(d) | FormEvent::ResponseUpdated(d) => d.form_id,
            FormEvent::ResponseDeleted { form_id, .. } => *form_id,
            FormEvent::FormPublished(d) | FormEvent::FormClosed(d) => d.form_id,
        }
    }
}
