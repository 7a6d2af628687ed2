//! In-memory storage for tests and local development.
//!
//! `MemoryStore` implements both repository traits against plain maps so the
//! executor can be driven without a database. Storage failures can be
//! injected to exercise error paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;

use formplug_core::{
    new_v7, CreatePluginConfigRequest, Error, Job, JobFilter, JobPatch, JobRepository, JobStatus,
    NewExecutionLog, NewJob, PluginConfig, PluginConfigRepository, PluginExecutionLog, Result,
};

/// In-memory job, log and plugin config store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    logs: RwLock<Vec<PluginExecutionLog>>,
    configs: RwLock<HashMap<Uuid, PluginConfig>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    broken_configs: std::sync::Mutex<HashSet<Uuid>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every subsequent job write fail with a storage error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent job or config read fail with a storage error.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make reads of one plugin config fail with a storage error.
    pub fn fail_config_reads(&self, id: Uuid, fail: bool) {
        let mut broken = self.broken_configs.lock().unwrap_or_else(|p| p.into_inner());
        if fail {
            broken.insert(id);
        } else {
            broken.remove(&id);
        }
    }

    /// Insert a job row as-is, bypassing `create` defaults.
    ///
    /// Used to stage state left behind by a previous process.
    pub async fn insert_job(&self, job: Job) {
        self.jobs.write().await.insert(job.id, job);
    }

    /// Snapshot of every stored job.
    pub async fn all_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| (j.scheduled_for, j.id));
        jobs
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn check_config_read(&self, id: Uuid) -> Result<()> {
        self.check_read()?;
        let broken = self.broken_configs.lock().unwrap_or_else(|p| p.into_inner());
        if broken.contains(&id) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn create(&self, job: NewJob) -> Result<Job> {
        self.check_write()?;
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(Error::Conflict(format!("job {} already exists", job.id)));
        }
        let record = Job {
            id: job.id,
            plugin_config_id: job.plugin_config_id,
            job_name: job.job_name,
            payload: job.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: job.max_attempts,
            scheduled_for: job.scheduled_for,
            started_at: None,
            completed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update(&self, job_id: Uuid, patch: JobPatch) -> Result<Job> {
        self.check_write()?;
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
        if let Some(expected) = patch.expected_status {
            if job.status != expected {
                return Err(Error::Conflict(format!(
                    "job {job_id} is {}, expected {expected}",
                    job.status
                )));
            }
        }
        patch.apply(job, Utc::now());
        Ok(job.clone())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.check_read()?;
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>> {
        self.check_read()?;
        let jobs = self.jobs.read().await;
        let mut result: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        result.sort_by_key(|j| (j.scheduled_for, j.id));
        if let Some(limit) = filter.limit {
            result.truncate(limit.max(0) as usize);
        }
        Ok(result)
    }

    async fn reset_running(&self, started_before: Option<DateTime<Utc>>) -> Result<Vec<Job>> {
        self.check_write()?;
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let mut reset = Vec::new();
        for job in jobs.values_mut() {
            if job.status != JobStatus::Running {
                continue;
            }
            let stale = match (started_before, job.started_at) {
                (None, _) => true,
                (Some(cutoff), Some(started)) => started < cutoff,
                (Some(_), None) => false,
            };
            if stale {
                JobPatch::new()
                    .status(JobStatus::Pending)
                    .started_at(None)
                    .apply(job, now);
                reset.push(job.clone());
            }
        }
        reset.sort_by_key(|j| (j.scheduled_for, j.id));
        Ok(reset)
    }

    async fn create_execution_log(&self, log: NewExecutionLog) -> Result<PluginExecutionLog> {
        self.check_write()?;
        let record = PluginExecutionLog {
            id: new_v7(),
            plugin_config_id: log.plugin_config_id,
            job_id: log.job_id,
            event: log.event,
            status: log.status,
            executed_at: Utc::now(),
            execution_time_ms: log.execution_time_ms,
            output_data: log.output_data,
            error_message: log.error_message,
            error_stack: log.error_stack,
        };
        self.logs.write().await.push(record.clone());
        Ok(record)
    }

    async fn list_execution_logs(&self, job_id: Uuid) -> Result<Vec<PluginExecutionLog>> {
        self.check_read()?;
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PluginConfigRepository for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<PluginConfig>> {
        self.check_config_read(id)?;
        Ok(self.configs.read().await.get(&id).cloned())
    }

    async fn create(&self, req: CreatePluginConfigRequest) -> Result<PluginConfig> {
        let now = Utc::now();
        let config = PluginConfig {
            id: new_v7(),
            form_id: req.form_id,
            plugin_id: req.plugin_id,
            enabled: req.enabled,
            config: if req.config.is_null() {
                json!({})
            } else {
                req.config
            },
            created_at: now,
            updated_at: now,
        };
        self.configs.write().await.insert(config.id, config.clone());
        Ok(config)
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        let mut configs = self.configs.write().await;
        let config = configs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("plugin config {id}")))?;
        config.enabled = enabled;
        config.updated_at = Utc::now();
        Ok(())
    }
}
