//! Plugin job executor.
//!
//! Drives each job through `pending → running → completed | failed`, retrying
//! failures with exponential backoff and repairing jobs left `running` by a
//! previous process.
//!
//! Every transition is a single conditional update on one job row, so the
//! executor can run many jobs concurrently without locks of its own. Plugins
//! run on spawned tasks; the executor never waits for them.
//!
//! ## Logging
//!
//! Structured fields: `subsystem = "jobs"`, `component`, `op`, `job_id`,
//! `plugin_id`, `plugin_config_id`, `attempt`, `duration_ms`, `error`.
//! ERROR is reserved for storage failures that were swallowed, WARN for job
//! failures and unknown job ids, INFO for lifecycle, DEBUG for decisions.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use formplug_core::{
    defaults, new_v7, short_id, CreateJobRequest, Error, EventBus, EventEnvelope, Job,
    JobFailure, JobFilter, JobPatch, JobPayload, JobRepository, JobStatus, NewExecutionLog,
    NewJob, PluginConfig, PluginConfigRepository, PluginEvent, PluginExecutionLog, Result,
};
use formplug_db::Database;

use crate::handler::{ExecuteRequest, PluginContext, PluginHandler, PluginOutcome};
use crate::registry::PluginRegistry;
use crate::retry::RetryPolicy;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Configuration for the job executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Attempts given to jobs created without an explicit limit.
    pub default_max_attempts: i32,
    /// Backoff between failed attempts.
    pub retry: RetryPolicy,
    /// Jobs `running` longer than this are reset by the watchdog.
    /// `None` disables the watchdog.
    pub running_timeout: Option<Duration>,
    /// How often the watchdog scans.
    pub watchdog_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: defaults::JOB_MAX_ATTEMPTS,
            retry: RetryPolicy::default(),
            running_timeout: None,
            watchdog_interval: Duration::from_secs(defaults::JOB_WATCHDOG_INTERVAL_SECS),
        }
    }
}

impl ExecutorConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `PLUGIN_JOB_MAX_ATTEMPTS` | `3` | Attempts per job |
    /// | `PLUGIN_JOB_BACKOFF_BASE_MS` | `1000` | First retry delay |
    /// | `PLUGIN_JOB_BACKOFF_MAX_MS` | `300000` | Retry delay cap |
    /// | `PLUGIN_JOB_RUNNING_TIMEOUT_SECS` | unset | Enables the watchdog |
    /// | `PLUGIN_JOB_WATCHDOG_INTERVAL_SECS` | `60` | Watchdog scan period |
    pub fn from_env() -> Self {
        let default_max_attempts = env_parse::<i32>("PLUGIN_JOB_MAX_ATTEMPTS")
            .unwrap_or(defaults::JOB_MAX_ATTEMPTS)
            .max(1);

        let base_ms =
            env_parse::<u64>("PLUGIN_JOB_BACKOFF_BASE_MS").unwrap_or(defaults::JOB_BACKOFF_BASE_MS);
        let max_ms =
            env_parse::<u64>("PLUGIN_JOB_BACKOFF_MAX_MS").unwrap_or(defaults::JOB_BACKOFF_MAX_MS);

        let running_timeout = env_parse::<u64>("PLUGIN_JOB_RUNNING_TIMEOUT_SECS")
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let watchdog_interval = env_parse::<u64>("PLUGIN_JOB_WATCHDOG_INTERVAL_SECS")
            .unwrap_or(defaults::JOB_WATCHDOG_INTERVAL_SECS)
            .max(1);

        Self {
            default_max_attempts,
            retry: RetryPolicy::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms)),
            running_timeout,
            watchdog_interval: Duration::from_secs(watchdog_interval),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry = RetryPolicy::new(base, max);
        self
    }

    pub fn with_running_timeout(mut self, timeout: Duration) -> Self {
        self.running_timeout = Some(timeout);
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

/// Counts reported by [`JobExecutor::initialize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitializeReport {
    /// Jobs found `running` and reset to `pending`.
    pub recovered: usize,
    /// Due jobs handed to execution.
    pub scheduled: usize,
    /// Pending jobs whose `scheduled_for` lies ahead, armed with a timer.
    pub deferred: usize,
    /// Jobs that could not be scheduled and were marked `failed`.
    pub failed: usize,
}

/// Persistent plugin job executor.
///
/// Cheap to clone; clones share the store, bus, registry and watchdog.
#[derive(Clone)]
pub struct JobExecutor {
    jobs: Arc<dyn JobRepository>,
    configs: Arc<dyn PluginConfigRepository>,
    events: Arc<dyn EventBus>,
    registry: Arc<PluginRegistry>,
    config: ExecutorConfig,
    watchdog: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl JobExecutor {
    /// Start building an executor over the given repositories.
    pub fn builder(
        jobs: Arc<dyn JobRepository>,
        configs: Arc<dyn PluginConfigRepository>,
    ) -> ExecutorBuilder {
        ExecutorBuilder::new(jobs, configs)
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Subscribe to lifecycle and dispatch events.
    pub fn events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    /// Fetch a job by id.
    pub async fn job(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.jobs.get(job_id).await
    }

    /// Execution log rows for a job, oldest first.
    pub async fn execution_logs(&self, job_id: Uuid) -> Result<Vec<PluginExecutionLog>> {
        self.jobs.list_execution_logs(job_id).await
    }

    // =========================================================================
    // STARTUP / SHUTDOWN
    // =========================================================================

    /// Recover from a previous run and schedule every pending job.
    ///
    /// Call once at startup before accepting new jobs. Store errors while
    /// recovering or listing propagate; a job that cannot be scheduled is
    /// marked `failed` and the rest continue.
    pub async fn initialize(&self) -> Result<InitializeReport> {
        let mut report = InitializeReport::default();

        let recovered = self.jobs.reset_running(None).await?;
        report.recovered = recovered.len();
        for job in &recovered {
            warn!(
                subsystem = "jobs",
                component = "executor",
                op = "recover",
                job_id = %job.id,
                attempts = job.attempts,
                "Job was running at shutdown, reset to pending"
            );
        }

        let now = Utc::now();
        let pending = self
            .jobs
            .list(JobFilter::with_status(JobStatus::Pending))
            .await?;

        for job in pending {
            let due = job.is_due(now);
            match self.schedule_job(&job).await {
                Ok(()) if due => report.scheduled += 1,
                Ok(()) => report.deferred += 1,
                Err(e) => {
                    report.failed += 1;
                    self.fail_unschedulable(&job, &e).await;
                }
            }
        }

        info!(
            subsystem = "jobs",
            component = "executor",
            op = "initialize",
            recovered = report.recovered,
            scheduled = report.scheduled,
            deferred = report.deferred,
            failed = report.failed,
            "Job executor initialized"
        );
        Ok(report)
    }

    /// Reset every `running` job to `pending` and stop the watchdog.
    ///
    /// In-flight plugin tasks and retry timers are left alone; a plugin that
    /// reports after this point finds its job `pending` and is ignored.
    pub async fn graceful_shutdown(&self) -> Result<usize> {
        self.stop_watchdog();

        let reset = self.jobs.reset_running(None).await?;
        for job in &reset {
            debug!(job_id = %job.id, "Reset running job for shutdown");
        }
        info!(
            subsystem = "jobs",
            component = "executor",
            op = "shutdown",
            reset = reset.len(),
            "Job executor stopped"
        );
        Ok(reset.len())
    }

    // =========================================================================
    // JOB CREATION / SCHEDULING
    // =========================================================================

    /// Persist a new job and schedule it.
    ///
    /// Validation and persistence errors propagate. A scheduling failure is
    /// logged only; the job stays `pending` for the next `initialize()`.
    pub async fn create_job(&self, req: CreateJobRequest) -> Result<Job> {
        let event = req.event.trim();
        if event.is_empty() {
            return Err(Error::InvalidInput("event name must not be empty".into()));
        }
        let max_attempts = req.max_attempts.unwrap_or(self.config.default_max_attempts);
        if max_attempts < 1 {
            return Err(Error::InvalidInput(format!(
                "max_attempts must be at least 1, got {max_attempts}"
            )));
        }

        let now = Utc::now();
        let job = self
            .jobs
            .create(NewJob {
                id: new_v7(),
                plugin_config_id: req.plugin_config_id,
                job_name: format!(
                    "{event}:{}:{}",
                    short_id(&req.plugin_config_id),
                    now.format("%Y%m%dT%H%M%S%.3fZ")
                ),
                payload: JobPayload::new(event, req.data),
                max_attempts,
                scheduled_for: req.scheduled_for.unwrap_or(now),
            })
            .await?;

        debug!(
            job_id = %job.id,
            job_name = %job.job_name,
            plugin_config_id = %job.plugin_config_id,
            "Job created"
        );

        if let Err(e) = self.schedule_job(&job).await {
            error!(
                subsystem = "jobs",
                component = "executor",
                op = "create",
                job_id = %job.id,
                error = %e,
                "Failed to schedule new job, left pending"
            );
        }
        Ok(job)
    }

    /// Hand a job to asynchronous execution.
    ///
    /// Publishes `plugin.job.created` and spawns a task that waits until
    /// `scheduled_for` and then runs [`execute_job`](Self::execute_job).
    /// Fails without a tokio runtime or when the plugin config lookup fails.
    pub async fn schedule_job(&self, job: &Job) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Internal(format!("no async runtime to schedule on: {e}")))?;

        let plugin_id = self
            .configs
            .get(job.plugin_config_id)
            .await?
            .map(|c| c.plugin_id);

        self.events.publish(PluginEvent::JobCreated {
            job_id: job.id,
            plugin_id: plugin_id.clone(),
        });

        let delay = (job.scheduled_for - Utc::now()).to_std().ok();
        debug!(
            job_id = %job.id,
            plugin_id = plugin_id.as_deref().unwrap_or("<unknown>"),
            delay_ms = delay.map(|d| d.as_millis() as u64).unwrap_or(0),
            "Job scheduled"
        );

        let executor = self.clone();
        let job = job.clone();
        runtime.spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            executor.run_job(job).await;
        });
        Ok(())
    }

    // =========================================================================
    // EXECUTION
    // =========================================================================

    /// Claim a pending job and dispatch it to its plugin.
    ///
    /// Runs on the caller's task, unlike [`schedule_job`](Self::schedule_job);
    /// jobs normally reach this through `schedule_job`. Returns once the
    /// plugin task is spawned. If another path already took the job, nothing
    /// happens.
    pub async fn execute_job(&self, job: Job) {
        self.run_job(job).await
    }

    fn run_job(&self, job: Job) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let started = Instant::now();
            let job_id = job.id;

            let claimed = self
                .jobs
                .update(
                    job_id,
                    JobPatch::new()
                        .expect(JobStatus::Pending)
                        .status(JobStatus::Running)
                        .started_at(Some(Utc::now())),
                )
                .await;

            let job = match claimed {
                Ok(job) => job,
                Err(e) if e.is_conflict() => {
                    debug!(job_id = %job_id, reason = %e, "Job no longer pending, skipping");
                    return;
                }
                Err(e) => {
                    self.apply_failure(
                        job_id,
                        JobFailure::from(e),
                        elapsed_ms(started),
                        JobStatus::Pending,
                    )
                    .await;
                    return;
                }
            };

            let (config, handler) = match self.resolve(&job).await {
                Ok(resolved) => resolved,
                Err(failure) => {
                    self.handle_job_failure(job_id, failure, elapsed_ms(started))
                        .await;
                    return;
                }
            };

            self.dispatch(job, config, handler, started);
        })
    }

    /// Look up the enabled plugin config and its handler.
    async fn resolve(
        &self,
        job: &Job,
    ) -> std::result::Result<(PluginConfig, Arc<dyn PluginHandler>), JobFailure> {
        let config = match self.configs.get(job.plugin_config_id).await {
            Ok(Some(config)) if config.enabled => config,
            Ok(_) => return Err(JobFailure::new(defaults::PLUGIN_CONFIG_UNAVAILABLE)),
            Err(e) => return Err(JobFailure::from(e)),
        };

        match self.registry.get(&config.plugin_id) {
            Some(handler) => Ok((config, handler)),
            None => Err(JobFailure::new(format!(
                "No handler registered for plugin: {}",
                config.plugin_id
            ))),
        }
    }

    /// Publish the execute event and run the plugin on its own task.
    fn dispatch(
        &self,
        job: Job,
        config: PluginConfig,
        handler: Arc<dyn PluginHandler>,
        started: Instant,
    ) {
        let request = ExecuteRequest::new(&job, &config);

        self.events.publish(PluginEvent::Execute {
            plugin_id: config.plugin_id.clone(),
            job_id: job.id,
            plugin_config_id: config.id,
            form_id: config.form_id,
            config: config.config.clone(),
            payload: serde_json::to_value(&job.payload).unwrap_or_default(),
            event: job.payload.event.clone(),
        });

        debug!(
            job_id = %job.id,
            plugin_id = %config.plugin_id,
            attempt = job.attempts + 1,
            "Dispatching job to plugin"
        );

        let executor = self.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            let ctx = PluginContext::new(request, executor.clone(), started);
            let plugin = tokio::spawn(async move { handler.execute(ctx).await });

            match plugin.await {
                Ok(PluginOutcome::Success(output)) => {
                    executor.handle_job_completion(job_id, output).await;
                }
                Ok(PluginOutcome::Failed(failure)) => {
                    executor
                        .handle_job_failure(job_id, failure, elapsed_ms(started))
                        .await;
                }
                Ok(PluginOutcome::Deferred) => {
                    debug!(job_id = %job_id, "Plugin deferred its result");
                }
                Err(e) => {
                    error!(job_id = %job_id, error = ?e, "Plugin task panicked");
                    executor
                        .handle_job_failure(
                            job_id,
                            JobFailure::new(format!("Plugin task failed: {e}")),
                            elapsed_ms(started),
                        )
                        .await;
                }
            }
        });
    }

    // =========================================================================
    // OUTCOMES
    // =========================================================================

    /// Record a successful execution.
    ///
    /// Only a `running` job is completed; anything else is ignored, so
    /// repeated reports are harmless. Never fails.
    pub async fn handle_job_completion(&self, job_id: Uuid, result: JsonValue) {
        let Some(job) = self.load_for_outcome(job_id, "complete").await else {
            return;
        };
        if job.status != JobStatus::Running {
            debug!(job_id = %job_id, status = %job.status, "Completion for job not running, ignoring");
            return;
        }

        let now = Utc::now();
        let execution_time = job.elapsed_ms(now);

        let completed = match self
            .jobs
            .update(
                job_id,
                JobPatch::new()
                    .expect(JobStatus::Running)
                    .status(JobStatus::Completed)
                    .completed_at(Some(now)),
            )
            .await
        {
            Ok(job) => job,
            Err(e) if e.is_conflict() => {
                debug!(job_id = %job_id, reason = %e, "Job changed before completion, ignoring");
                return;
            }
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "executor",
                    op = "complete",
                    job_id = %job_id,
                    error = %e,
                    "Failed to mark job completed"
                );
                return;
            }
        };

        if let Err(e) = self
            .jobs
            .create_execution_log(NewExecutionLog::success(
                &completed,
                result.clone(),
                execution_time,
            ))
            .await
        {
            error!(job_id = %job_id, error = %e, "Failed to write execution log");
        }

        self.events.publish(PluginEvent::JobCompleted {
            job_id,
            plugin_config_id: completed.plugin_config_id,
            event: completed.payload.event.clone(),
            result,
            execution_time,
        });

        info!(
            subsystem = "jobs",
            component = "executor",
            op = "complete",
            job_id = %job_id,
            plugin_config_id = %completed.plugin_config_id,
            attempt = completed.attempts + 1,
            duration_ms = execution_time,
            "Job completed"
        );
    }

    /// Record a failed execution and either retry or fail the job for good.
    ///
    /// The attempt count after this failure is `attempts + 1`. Below
    /// `max_attempts` the job goes back to `pending` with a backoff delay,
    /// otherwise it becomes `failed`. Only a `running` job is affected; a
    /// report for a job already reset by shutdown or the watchdog is ignored
    /// and its attempts stay unchanged. Never fails; storage errors are logged.
    pub async fn handle_job_failure(&self, job_id: Uuid, failure: JobFailure, execution_time_ms: i64) {
        self.apply_failure(job_id, failure, execution_time_ms, JobStatus::Running)
            .await
    }

    /// Retry or fail a job currently in `expected` status.
    ///
    /// `Pending` is only used when claiming the job hit a storage error, so
    /// the job never left `pending`.
    async fn apply_failure(
        &self,
        job_id: Uuid,
        failure: JobFailure,
        execution_time_ms: i64,
        expected: JobStatus,
    ) {
        let Some(job) = self.load_for_outcome(job_id, "fail").await else {
            return;
        };
        if job.status.is_terminal() {
            warn!(job_id = %job_id, status = %job.status, "Failure reported for finished job, ignoring");
            return;
        }
        if job.status != expected {
            debug!(
                job_id = %job_id,
                status = %job.status,
                expected = %expected,
                error = %failure,
                "Failure for job in unexpected state, ignoring"
            );
            return;
        }

        let now = Utc::now();
        let attempt = job.attempts + 1;

        if attempt < job.max_attempts {
            let delay = self.config.retry.delay_for_attempt(attempt as u32);
            let scheduled_for = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(now);

            let retry = self
                .jobs
                .update(
                    job_id,
                    JobPatch::new()
                        .expect(expected)
                        .status(JobStatus::Pending)
                        .attempts(attempt)
                        .started_at(None)
                        .scheduled_for(scheduled_for)
                        .last_error(Some(failure.message.clone())),
                )
                .await;

            let retry = match retry {
                Ok(job) => job,
                Err(e) => {
                    self.log_outcome_error(job_id, "retry", &e);
                    return;
                }
            };

            warn!(
                subsystem = "jobs",
                component = "executor",
                op = "retry",
                job_id = %job_id,
                attempt,
                max_attempts = job.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Job failed, retry scheduled"
            );

            if let Err(e) = self.schedule_job(&retry).await {
                error!(
                    job_id = %job_id,
                    error = %e,
                    "Failed to schedule retry, job left pending"
                );
            }
            return;
        }

        let failed = self
            .jobs
            .update(
                job_id,
                JobPatch::new()
                    .expect(expected)
                    .status(JobStatus::Failed)
                    .attempts(attempt.min(job.max_attempts))
                    .completed_at(Some(now))
                    .last_error(Some(failure.message.clone())),
            )
            .await;

        let failed = match failed {
            Ok(job) => job,
            Err(e) => {
                self.log_outcome_error(job_id, "fail", &e);
                return;
            }
        };

        self.record_terminal_failure(&failed, &failure, execution_time_ms)
            .await;
    }

    // =========================================================================
    // WATCHDOG
    // =========================================================================

    /// Start the stale-job watchdog if a running timeout is configured.
    ///
    /// Returns `false` when the watchdog is disabled or already running.
    pub fn spawn_watchdog(&self) -> bool {
        let Some(timeout) = self.config.running_timeout else {
            debug!("Watchdog disabled, no running timeout configured");
            return false;
        };

        let mut slot = self.watchdog.lock().unwrap_or_else(|p| p.into_inner());
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let executor = self.clone();
        let interval = self.config.watchdog_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = executor.watchdog_sweep().await {
                    error!(
                        subsystem = "jobs",
                        component = "watchdog",
                        error = %e,
                        "Watchdog sweep failed"
                    );
                }
            }
        }));

        info!(
            subsystem = "jobs",
            component = "watchdog",
            timeout_secs = timeout.as_secs(),
            interval_secs = interval.as_secs(),
            "Watchdog started"
        );
        true
    }

    /// Reset jobs stuck in `running` past the timeout and reschedule them.
    ///
    /// Returns the number of jobs reset. Does nothing without a timeout.
    pub async fn watchdog_sweep(&self) -> Result<usize> {
        let Some(timeout) = self.config.running_timeout else {
            return Ok(0);
        };
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|e| Error::Config(format!("running timeout out of range: {e}")))?;
        let cutoff = Utc::now() - timeout;

        let stale = self.jobs.reset_running(Some(cutoff)).await?;
        for job in &stale {
            warn!(
                subsystem = "jobs",
                component = "watchdog",
                job_id = %job.id,
                attempts = job.attempts,
                "Job exceeded running timeout, reset to pending"
            );
            if let Err(e) = self.schedule_job(job).await {
                error!(job_id = %job.id, error = %e, "Failed to reschedule stale job");
            }
        }
        Ok(stale.len())
    }

    fn stop_watchdog(&self) {
        let mut slot = self.watchdog.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
            debug!("Watchdog stopped");
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    async fn load_for_outcome(&self, job_id: Uuid, op: &'static str) -> Option<Job> {
        match self.jobs.get(job_id).await {
            Ok(Some(job)) => Some(job),
            Ok(None) => {
                warn!(job_id = %job_id, op, "Outcome reported for unknown job");
                None
            }
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "executor",
                    op,
                    job_id = %job_id,
                    error = %e,
                    "Failed to load job"
                );
                None
            }
        }
    }

    fn log_outcome_error(&self, job_id: Uuid, op: &'static str, e: &Error) {
        if e.is_conflict() {
            debug!(job_id = %job_id, op, reason = %e, "Job changed concurrently, ignoring");
        } else {
            error!(
                subsystem = "jobs",
                component = "executor",
                op,
                job_id = %job_id,
                error = %e,
                "Failed to record job failure"
            );
        }
    }

    /// Write the failure log row and announce the terminal failure.
    async fn record_terminal_failure(&self, job: &Job, failure: &JobFailure, execution_time_ms: i64) {
        if let Err(e) = self
            .jobs
            .create_execution_log(NewExecutionLog::failure(job, failure, execution_time_ms))
            .await
        {
            error!(job_id = %job.id, error = %e, "Failed to write execution log");
        }

        self.events.publish(PluginEvent::JobFailed {
            job_id: job.id,
            error: failure.message.clone(),
        });

        warn!(
            subsystem = "jobs",
            component = "executor",
            op = "fail",
            job_id = %job.id,
            plugin_config_id = %job.plugin_config_id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            error = %failure,
            "Job failed permanently"
        );
    }

    /// Mark a pending job `failed` because it could not be scheduled.
    async fn fail_unschedulable(&self, job: &Job, cause: &Error) {
        let failure = JobFailure::new(format!("Failed to schedule job: {cause}"));
        let failed = self
            .jobs
            .update(
                job.id,
                JobPatch::new()
                    .expect(JobStatus::Pending)
                    .status(JobStatus::Failed)
                    .completed_at(Some(Utc::now()))
                    .last_error(Some(failure.message.clone())),
            )
            .await;

        match failed {
            Ok(failed) => self.record_terminal_failure(&failed, &failure, 0).await,
            Err(e) => self.log_outcome_error(job.id, "initialize", &e),
        }
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    started.elapsed().as_millis() as i64
}

/// Builder for [`JobExecutor`].
pub struct ExecutorBuilder {
    jobs: Arc<dyn JobRepository>,
    configs: Arc<dyn PluginConfigRepository>,
    events: Option<Arc<dyn EventBus>>,
    registry: PluginRegistry,
    config: ExecutorConfig,
}

impl ExecutorBuilder {
    pub fn new(jobs: Arc<dyn JobRepository>, configs: Arc<dyn PluginConfigRepository>) -> Self {
        Self {
            jobs,
            configs,
            events: None,
            registry: PluginRegistry::new(),
            config: ExecutorConfig::default(),
        }
    }

    /// Use the PostgreSQL repositories of a connected database.
    pub fn from_database(db: &Database) -> Self {
        Self::new(
            Arc::new(db.jobs.clone()),
            Arc::new(db.plugin_configs.clone()),
        )
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn build(self) -> JobExecutor {
        JobExecutor {
            jobs: self.jobs,
            configs: self.configs,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(formplug_core::BroadcastEventBus::default())),
            registry: Arc::new(self.registry),
            config: self.config,
            watchdog: Arc::new(Mutex::new(None)),
        }
    }
}
