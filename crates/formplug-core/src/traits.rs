//! Repository traits implemented by the storage layer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::*;
use crate::Result;

// =============================================================================
// JOB STORE
// =============================================================================

/// Persistence for plugin jobs and their execution logs.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Persist a new job in `pending` with zero attempts.
    async fn create(&self, job: NewJob) -> Result<Job>;

    /// Apply a patch to one job and return the updated record.
    ///
    /// Fails with `Error::JobNotFound` for an unknown id and with
    /// `Error::Conflict` when `patch.expected_status` does not match.
    async fn update(&self, job_id: Uuid, patch: JobPatch) -> Result<Job>;

    /// Get job by ID.
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// List jobs matching a filter, oldest `scheduled_for` first.
    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>>;

    /// Move `running` jobs back to `pending`, clearing `started_at` and
    /// leaving attempts unchanged.
    ///
    /// With `started_before` set, only jobs started before that instant are
    /// reset. Returns the reset jobs.
    async fn reset_running(&self, started_before: Option<DateTime<Utc>>) -> Result<Vec<Job>>;

    /// Append an execution log row.
    async fn create_execution_log(&self, log: NewExecutionLog) -> Result<PluginExecutionLog>;

    /// Execution log rows for one job, oldest first.
    async fn list_execution_logs(&self, job_id: Uuid) -> Result<Vec<PluginExecutionLog>>;
}

// =============================================================================
// PLUGIN CONFIGURATION
// =============================================================================

/// Lookup of per-form plugin settings.
#[async_trait]
pub trait PluginConfigRepository: Send + Sync {
    /// Get a plugin configuration by ID.
    async fn get(&self, id: Uuid) -> Result<Option<PluginConfig>>;

    /// Create a plugin configuration.
    async fn create(&self, req: CreatePluginConfigRequest) -> Result<PluginConfig>;

    /// Enable or disable a configuration.
    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<()>;
}
