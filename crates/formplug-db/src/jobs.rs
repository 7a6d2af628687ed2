//! PostgreSQL job repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use formplug_core::{
    new_v7, Error, ExecutionStatus, Job, JobFilter, JobPatch, JobPayload, JobRepository,
    JobStatus, NewExecutionLog, NewJob, PluginExecutionLog, Result,
};

const JOB_COLUMNS: &str = "id, plugin_config_id, job_name, payload, status, attempts, max_attempts,
     scheduled_for, started_at, completed_at, last_error, created_at, updated_at";

const LOG_COLUMNS: &str = "id, plugin_config_id, job_id, event, status, executed_at,
     execution_time_ms, output_data, error_message, error_stack";

/// PostgreSQL implementation of JobRepository.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
}

impl PgJobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: sqlx::postgres::PgRow) -> Result<Job> {
        let payload: JsonValue = row.get("payload");
        let payload: JobPayload = serde_json::from_value(payload)?;
        let status: String = row.get("status");
        Ok(Job {
            id: row.get("id"),
            plugin_config_id: row.get("plugin_config_id"),
            job_name: row.get("job_name"),
            payload,
            status: JobStatus::parse(&status)?,
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            scheduled_for: row.get("scheduled_for"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            last_error: row.get("last_error"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn parse_log_row(row: sqlx::postgres::PgRow) -> Result<PluginExecutionLog> {
        let status: String = row.get("status");
        Ok(PluginExecutionLog {
            id: row.get("id"),
            plugin_config_id: row.get("plugin_config_id"),
            job_id: row.get("job_id"),
            event: row.get("event"),
            status: ExecutionStatus::parse(&status)?,
            executed_at: row.get("executed_at"),
            execution_time_ms: row.get("execution_time_ms"),
            output_data: row.get("output_data"),
            error_message: row.get("error_message"),
            error_stack: row.get("error_stack"),
        })
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    async fn create(&self, job: NewJob) -> Result<Job> {
        let now = Utc::now();
        let payload = serde_json::to_value(&job.payload)?;

        let row = sqlx::query(&format!(
            "INSERT INTO plugin_job (id, plugin_config_id, job_name, payload, status, attempts,
                                     max_attempts, scheduled_for, created_at, updated_at)
             VALUES ($1, $2, $3, $4, 'pending', 0, $5, $6, $7, $7)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job.id)
        .bind(job.plugin_config_id)
        .bind(&job.job_name)
        .bind(&payload)
        .bind(job.max_attempts)
        .bind(job.scheduled_for)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_job_row(row)
    }

    async fn update(&self, job_id: Uuid, patch: JobPatch) -> Result<Job> {
        let now = Utc::now();

        // Nested options are split into a "touch" flag and a value so that
        // `Some(None)` can clear a column.
        let (set_started, started_at) = split(patch.started_at);
        let (set_completed, completed_at) = split(patch.completed_at);
        let (set_error, last_error) = split(patch.last_error);

        let row = sqlx::query(&format!(
            "UPDATE plugin_job SET
                 status = COALESCE($2, status),
                 attempts = COALESCE($3, attempts),
                 scheduled_for = COALESCE($4, scheduled_for),
                 started_at = CASE WHEN $5 THEN $6 ELSE started_at END,
                 completed_at = CASE WHEN $7 THEN $8 ELSE completed_at END,
                 last_error = CASE WHEN $9 THEN $10 ELSE last_error END,
                 updated_at = $11
             WHERE id = $1 AND ($12::text IS NULL OR status = $12)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.attempts)
        .bind(patch.scheduled_for)
        .bind(set_started)
        .bind(started_at)
        .bind(set_completed)
        .bind(completed_at)
        .bind(set_error)
        .bind(last_error)
        .bind(now)
        .bind(patch.expected_status.map(|s| s.as_str()))
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        match row {
            Some(row) => Self::parse_job_row(row),
            None => {
                // Distinguish a missing row from a lost guard.
                let current: Option<String> =
                    sqlx::query_scalar("SELECT status FROM plugin_job WHERE id = $1")
                        .bind(job_id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(Error::Database)?;
                match current {
                    None => Err(Error::JobNotFound(job_id)),
                    Some(status) => Err(Error::Conflict(format!(
                        "job {job_id} is {status}, expected {}",
                        patch
                            .expected_status
                            .map(|s| s.as_str())
                            .unwrap_or("any")
                    ))),
                }
            }
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM plugin_job WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.map(Self::parse_job_row).transpose()
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM plugin_job
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::timestamptz IS NULL OR scheduled_for <= $2)
               AND ($3::uuid IS NULL OR plugin_config_id = $3)
             ORDER BY scheduled_for ASC, id ASC
             LIMIT $4"
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.due_before)
        .bind(filter.plugin_config_id)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn reset_running(&self, started_before: Option<DateTime<Utc>>) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "UPDATE plugin_job
             SET status = 'pending', started_at = NULL, updated_at = now()
             WHERE status = 'running'
               AND ($1::timestamptz IS NULL OR started_at < $1)
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(started_before)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_job_row).collect()
    }

    async fn create_execution_log(&self, log: NewExecutionLog) -> Result<PluginExecutionLog> {
        let row = sqlx::query(&format!(
            "INSERT INTO plugin_execution_log
                 (id, plugin_config_id, job_id, event, status, executed_at, execution_time_ms,
                  output_data, error_message, error_stack)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING {LOG_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(log.plugin_config_id)
        .bind(log.job_id)
        .bind(&log.event)
        .bind(log.status.as_str())
        .bind(Utc::now())
        .bind(log.execution_time_ms)
        .bind(&log.output_data)
        .bind(&log.error_message)
        .bind(&log.error_stack)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_log_row(row)
    }

    async fn list_execution_logs(&self, job_id: Uuid) -> Result<Vec<PluginExecutionLog>> {
        let rows = sqlx::query(&format!(
            "SELECT {LOG_COLUMNS} FROM plugin_execution_log
             WHERE job_id = $1
             ORDER BY executed_at ASC, id ASC"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter().map(Self::parse_log_row).collect()
    }
}

fn split<T>(value: Option<Option<T>>) -> (bool, Option<T>) {
    match value {
        Some(inner) => (true, inner),
        None => (false, None),
    }
}
