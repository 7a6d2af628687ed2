//! End-to-end executor behavior against the in-memory store.
//!
//! Backoff is shrunk to milliseconds so retry chains finish quickly.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map};
use uuid::Uuid;

use formplug_db::MemoryStore;
use formplug_jobs::{
    defaults, CreateJobRequest, CreatePluginConfigRequest, Error, ExecutionStatus, ExecutorConfig,
    FnHandler, Job, JobExecutor, JobFailure, JobPayload, JobStatus, NoOpHandler, PluginConfig,
    PluginConfigRepository, PluginContext, PluginEvent, PluginHandler, PluginOutcome,
    PluginRegistry, RecordingEventBus,
};

const CREATED: &str = "plugin.job.created";
const COMPLETED: &str = "plugin.job.completed";
const FAILED: &str = "plugin.job.failed";

struct Harness {
    store: Arc<MemoryStore>,
    bus: Arc<RecordingEventBus>,
    executor: JobExecutor,
}

fn fast_config() -> ExecutorConfig {
    ExecutorConfig::default()
        .with_max_attempts(3)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(8))
}

fn harness(registry: PluginRegistry, config: ExecutorConfig) -> Harness {
    let store = MemoryStore::arc();
    let bus = Arc::new(RecordingEventBus::new());
    let executor = JobExecutor::builder(store.clone(), store.clone())
        .with_config(config)
        .with_event_bus(bus.clone())
        .with_registry(registry)
        .build();
    Harness {
        store,
        bus,
        executor,
    }
}

async fn plugin_config(store: &MemoryStore, plugin_id: &str, enabled: bool) -> PluginConfig {
    PluginConfigRepository::create(
        store,
        CreatePluginConfigRequest {
            form_id: Uuid::now_v7(),
            plugin_id: plugin_id.to_string(),
            enabled,
            config: json!({"url": "https://hooks.example.test/form"}),
        },
    )
    .await
    .expect("create plugin config")
}

/// Poll until `check` holds or panic after five seconds.
async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_status(executor: &JobExecutor, job_id: Uuid, status: JobStatus) -> Job {
    wait_until(&format!("job {job_id} to be {status}"), move || async move {
        matches!(executor.job(job_id).await, Ok(Some(job)) if job.status == status)
    })
    .await;
    executor.job(job_id).await.unwrap().unwrap()
}

fn failing_handler(plugin_id: &str, calls: Arc<AtomicUsize>) -> impl PluginHandler + 'static {
    FnHandler::new(plugin_id.to_string(), move |_req| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("boom"))
        }
    })
}

fn echo_handler(plugin_id: &str, calls: Arc<AtomicUsize>) -> impl PluginHandler + 'static {
    FnHandler::new(plugin_id.to_string(), move |req| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"event": req.event(), "attempt": req.attempt}))
        }
    })
}

fn stored_job(plugin_config_id: Uuid, status: JobStatus, attempts: i32) -> Job {
    let now = Utc::now();
    Job {
        id: Uuid::now_v7(),
        plugin_config_id,
        job_name: "response.submitted:stored".to_string(),
        payload: JobPayload::new("response.submitted", Map::new()),
        status,
        attempts,
        max_attempts: 3,
        scheduled_for: now - chrono::Duration::seconds(30),
        started_at: (status == JobStatus::Running).then_some(now - chrono::Duration::seconds(5)),
        completed_at: None,
        last_error: None,
        created_at: now - chrono::Duration::minutes(1),
        updated_at: now,
    }
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[tokio::test]
async fn test_always_failing_plugin_exhausts_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = PluginRegistry::new()
        .with_handler(failing_handler("flaky", calls.clone()))
        .unwrap();
    let h = &harness(registry, fast_config());
    let config = plugin_config(&h.store, "flaky", true).await;

    let job = h
        .executor
        .create_job(CreateJobRequest::new(config.id, "response.submitted"))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.max_attempts, 3);

    let failed = wait_for_status(&h.executor, job.id, JobStatus::Failed).await;
    wait_until("failed event", move || async move { h.bus.count_for(FAILED, job.id) == 1 }).await;

    // Let any stray retry timer fire before counting.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(failed.attempts, 3);
    assert!(failed.attempts <= failed.max_attempts);
    assert_eq!(failed.last_error.as_deref(), Some("boom"));
    assert!(failed.completed_at.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let logs = h.executor.execution_logs(job.id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, ExecutionStatus::Failed);
    assert_eq!(logs[0].error_message.as_deref(), Some("boom"));
    assert!(logs[0].error_stack.is_some());

    assert_eq!(h.bus.count_for(FAILED, job.id), 1);
    assert_eq!(h.bus.count_for(COMPLETED, job.id), 0);
    // Initial schedule plus two retries.
    assert_eq!(h.bus.count_for(CREATED, job.id), 3);
}

#[tokio::test]
async fn test_succeeding_plugin_completes_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = PluginRegistry::new()
        .with_handler(echo_handler("echo", calls.clone()))
        .unwrap();
    let h = &harness(registry, fast_config());
    let config = plugin_config(&h.store, "echo", true).await;

    let job = h
        .executor
        .create_job(CreateJobRequest::new(config.id, "form.published"))
        .await
        .unwrap();

    let completed = wait_for_status(&h.executor, job.id, JobStatus::Completed).await;
    wait_until("completed event", move || async move { h.bus.count_for(COMPLETED, job.id) == 1 }).await;

    assert_eq!(completed.attempts, 0);
    assert!(completed.completed_at.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let logs = h.executor.execution_logs(job.id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, ExecutionStatus::Success);
    assert_eq!(
        logs[0].output_data,
        Some(json!({"event": "form.published", "attempt": 1}))
    );
    assert!(logs[0].execution_time_ms >= 0);

    assert_eq!(h.bus.count_for(FAILED, job.id), 0);
    let completed_events = h.bus.named(COMPLETED);
    match &completed_events[0] {
        PluginEvent::JobCompleted {
            plugin_config_id,
            event,
            result,
            ..
        } => {
            assert_eq!(*plugin_config_id, config.id);
            assert_eq!(event, "form.published");
            assert_eq!(result["attempt"], json!(1));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_recovered_job_with_missing_config_takes_failure_path() {
    let h = &harness(PluginRegistry::new(), fast_config());
    let missing_config = Uuid::now_v7();
    let job = stored_job(missing_config, JobStatus::Running, 1);
    h.store.insert_job(job.clone()).await;

    let report = h.executor.initialize().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.scheduled, 1);
    assert_eq!(report.failed, 0);

    let failed = wait_for_status(&h.executor, job.id, JobStatus::Failed).await;
    assert_eq!(failed.attempts, 3);
    assert_eq!(
        failed.last_error.as_deref(),
        Some(defaults::PLUGIN_CONFIG_UNAVAILABLE)
    );

    wait_until("failure log row", move || async move {
        h.executor.execution_logs(job.id).await.unwrap().len() == 1
    })
    .await;
    let logs = h.executor.execution_logs(job.id).await.unwrap();
    assert_eq!(
        logs[0].error_message.as_deref(),
        Some("Plugin config not found or disabled")
    );

    let created = h.bus.named(CREATED);
    assert!(created.iter().all(|e| matches!(
        e,
        PluginEvent::JobCreated { plugin_id: None, .. }
    )));
}

#[tokio::test]
async fn test_shutdown_resets_running_jobs_for_next_start() {
    let store = MemoryStore::arc();
    let config = plugin_config(&store, "echo", true).await;
    let first = stored_job(config.id, JobStatus::Running, 0);
    let second = stored_job(config.id, JobStatus::Running, 2);
    store.insert_job(first.clone()).await;
    store.insert_job(second.clone()).await;

    let stopping = JobExecutor::builder(store.clone(), store.clone())
        .with_config(fast_config())
        .build();
    assert_eq!(stopping.graceful_shutdown().await.unwrap(), 2);

    for job in store.all_jobs().await {
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
    }
    let second_after = stopping.job(second.id).await.unwrap().unwrap();
    assert_eq!(second_after.attempts, 2);

    let calls = Arc::new(AtomicUsize::new(0));
    let restarted = JobExecutor::builder(store.clone(), store.clone())
        .with_config(fast_config())
        .with_registry(
            PluginRegistry::new()
                .with_handler(echo_handler("echo", calls.clone()))
                .unwrap(),
        )
        .build();
    let report = restarted.initialize().await.unwrap();
    assert_eq!(report.recovered, 0);
    assert_eq!(report.scheduled, 2);

    wait_for_status(&restarted, first.id, JobStatus::Completed).await;
    wait_for_status(&restarted, second.id, JobStatus::Completed).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// =============================================================================
// RECOVERY / WATCHDOG
// =============================================================================

#[tokio::test]
async fn test_recovery_keeps_attempts_for_future_job() {
    let h = &harness(PluginRegistry::new(), fast_config());
    let mut job = stored_job(Uuid::now_v7(), JobStatus::Running, 2);
    job.scheduled_for = Utc::now() + chrono::Duration::hours(1);
    h.store.insert_job(job.clone()).await;

    let report = h.executor.initialize().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.scheduled, 0);
    assert_eq!(report.deferred, 1);

    let recovered = h.executor.job(job.id).await.unwrap().unwrap();
    assert_eq!(recovered.status, JobStatus::Pending);
    assert_eq!(recovered.attempts, 2);
    assert!(recovered.started_at.is_none());
}

#[tokio::test]
async fn test_initialize_with_empty_store() {
    let h = &harness(PluginRegistry::new(), fast_config());
    let report = h.executor.initialize().await.unwrap();
    assert_eq!(report, Default::default());
    assert!(h.bus.events().is_empty());
}

#[tokio::test]
async fn test_initialize_propagates_unreachable_store() {
    let h = &harness(PluginRegistry::new(), fast_config());
    h.store.fail_writes(true);
    let err = h.executor.initialize().await.unwrap_err();
    assert!(matches!(err, Error::Database(_)));
}

#[tokio::test]
async fn test_initialize_fails_only_the_unschedulable_job() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = PluginRegistry::new()
        .with_handler(echo_handler("echo", calls.clone()))
        .unwrap();
    let h = &harness(registry, fast_config());
    let broken_config = plugin_config(&h.store, "echo", true).await;
    let healthy_config = plugin_config(&h.store, "echo", true).await;

    let broken = stored_job(broken_config.id, JobStatus::Pending, 1);
    let healthy = stored_job(healthy_config.id, JobStatus::Pending, 0);
    h.store.insert_job(broken.clone()).await;
    h.store.insert_job(healthy.clone()).await;
    h.store.fail_config_reads(broken_config.id, true);

    let report = h.executor.initialize().await.unwrap();
    assert_eq!(report.recovered, 0);
    assert_eq!(report.scheduled, 1);
    assert_eq!(report.failed, 1);

    let failed = h.executor.job(broken.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 1);
    assert!(failed.completed_at.is_some());
    assert!(failed
        .last_error
        .as_deref()
        .is_some_and(|e| e.starts_with("Failed to schedule job")));

    let logs = h.executor.execution_logs(broken.id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, ExecutionStatus::Failed);
    assert_eq!(h.bus.count_for(FAILED, broken.id), 1);
    assert_eq!(h.bus.count_for(CREATED, broken.id), 0);

    wait_for_status(&h.executor, healthy.id, JobStatus::Completed).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.executor.execution_logs(healthy.id).await.unwrap().len(), 1);
    assert_eq!(h.bus.count_for(FAILED, healthy.id), 0);
}

#[tokio::test]
async fn test_watchdog_sweep_resets_stale_running_job() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = PluginRegistry::new()
        .with_handler(echo_handler("echo", calls.clone()))
        .unwrap();
    let h = &harness(
        registry,
        fast_config().with_running_timeout(Duration::from_secs(60)),
    );
    let config = plugin_config(&h.store, "echo", true).await;

    let mut stale = stored_job(config.id, JobStatus::Running, 1);
    stale.started_at = Some(Utc::now() - chrono::Duration::minutes(10));
    let fresh = stored_job(config.id, JobStatus::Running, 0);
    h.store.insert_job(stale.clone()).await;
    h.store.insert_job(fresh.clone()).await;

    assert_eq!(h.executor.watchdog_sweep().await.unwrap(), 1);

    let done = wait_for_status(&h.executor, stale.id, JobStatus::Completed).await;
    assert_eq!(done.attempts, 1);
    let untouched = h.executor.job(fresh.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, JobStatus::Running);
}

#[tokio::test]
async fn test_watchdog_disabled_without_timeout() {
    let h = &harness(PluginRegistry::new(), fast_config());
    assert!(!h.executor.spawn_watchdog());
    assert_eq!(h.executor.watchdog_sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn test_watchdog_spawns_once_and_stops_on_shutdown() {
    let h = &harness(
        PluginRegistry::new(),
        fast_config()
            .with_running_timeout(Duration::from_secs(60))
            .with_watchdog_interval(Duration::from_millis(10)),
    );
    assert!(h.executor.spawn_watchdog());
    assert!(!h.executor.spawn_watchdog());

    assert_eq!(h.executor.graceful_shutdown().await.unwrap(), 0);
    tokio::task::yield_now().await;
    assert!(h.executor.spawn_watchdog());
    h.executor.graceful_shutdown().await.unwrap();
}

// =============================================================================
// FAILURE ROUTING
// =============================================================================

#[tokio::test]
async fn test_disabled_config_fails_like_any_error() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = PluginRegistry::new()
        .with_handler(echo_handler("echo", calls.clone()))
        .unwrap();
    let h = &harness(registry, fast_config());
    let config = plugin_config(&h.store, "echo", false).await;

    let job = h
        .executor
        .create_job(CreateJobRequest::new(config.id, "response.submitted").with_max_attempts(1))
        .await
        .unwrap();

    let failed = wait_for_status(&h.executor, job.id, JobStatus::Failed).await;
    assert_eq!(failed.attempts, 1);
    assert_eq!(
        failed.last_error.as_deref(),
        Some(defaults::PLUGIN_CONFIG_UNAVAILABLE)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unregistered_plugin_is_a_failure() {
    let h = &harness(PluginRegistry::new(), fast_config());
    let config = plugin_config(&h.store, "slack", true).await;

    let job = h
        .executor
        .create_job(CreateJobRequest::new(config.id, "response.submitted").with_max_attempts(2))
        .await
        .unwrap();

    let failed = wait_for_status(&h.executor, job.id, JobStatus::Failed).await;
    assert_eq!(failed.attempts, 2);
    assert_eq!(
        failed.last_error.as_deref(),
        Some("No handler registered for plugin: slack")
    );
    assert!(h.bus.named("plugin.slack.execute").is_empty());
}

#[tokio::test]
async fn test_flaky_plugin_recovers_on_retry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = FnHandler::new("flaky", move |_req| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(anyhow::anyhow!("connection reset"))
            } else {
                Ok(json!({"delivered": true}))
            }
        }
    });
    let h = &harness(
        PluginRegistry::new().with_handler(handler).unwrap(),
        fast_config(),
    );
    let config = plugin_config(&h.store, "flaky", true).await;

    let job = h
        .executor
        .create_job(CreateJobRequest::new(config.id, "response.updated"))
        .await
        .unwrap();

    let done = wait_for_status(&h.executor, job.id, JobStatus::Completed).await;
    assert_eq!(done.attempts, 1);
    assert_eq!(done.last_error.as_deref(), Some("connection reset"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    wait_until("success log", move || async move {
        !h.executor.execution_logs(job.id).await.unwrap().is_empty()
    })
    .await;
    let logs = h.executor.execution_logs(job.id).await.unwrap();
    assert_eq!(logs.len(), 1, "retries do not write log rows");
    assert_eq!(logs[0].status, ExecutionStatus::Success);
    assert_eq!(h.bus.count_for(FAILED, job.id), 0);
}

#[tokio::test]
async fn test_retry_is_delayed_by_backoff() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = PluginRegistry::new()
        .with_handler(failing_handler("flaky", calls.clone()))
        .unwrap();
    let h = &harness(
        registry,
        ExecutorConfig::default()
            .with_max_attempts(3)
            .with_backoff(Duration::from_secs(30), Duration::from_secs(60)),
    );
    let config = plugin_config(&h.store, "flaky", true).await;

    let before = Utc::now();
    let job = h
        .executor
        .create_job(CreateJobRequest::new(config.id, "response.submitted"))
        .await
        .unwrap();

    wait_until("first failure recorded", move || async move {
        matches!(h.executor.job(job.id).await, Ok(Some(j)) if j.attempts == 1)
    })
    .await;
    let pending = h.executor.job(job.id).await.unwrap().unwrap();
    assert_eq!(pending.status, JobStatus::Pending);
    assert!(pending.started_at.is_none());
    assert!(pending.scheduled_for >= before + chrono::Duration::seconds(30));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_plugin_is_recorded_as_failure() {
    struct Panics;

    #[async_trait]
    impl PluginHandler for Panics {
        fn plugin_id(&self) -> &str {
            "panics"
        }

        async fn execute(&self, _ctx: PluginContext) -> PluginOutcome {
            panic!("plugin bug");
        }
    }

    let h = &harness(PluginRegistry::new().with_handler(Panics).unwrap(), fast_config());
    let config = plugin_config(&h.store, "panics", true).await;
    let job = h
        .executor
        .create_job(CreateJobRequest::new(config.id, "response.submitted").with_max_attempts(1))
        .await
        .unwrap();

    let failed = wait_for_status(&h.executor, job.id, JobStatus::Failed).await;
    assert!(failed
        .last_error
        .as_deref()
        .unwrap_or_default()
        .starts_with("Plugin task failed"));
}

// =============================================================================
// OUTCOME HANDLERS
// =============================================================================

#[tokio::test]
async fn test_second_completion_is_ignored() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = PluginRegistry::new()
        .with_handler(echo_handler("echo", calls))
        .unwrap();
    let h = &harness(registry, fast_config());
    let config = plugin_config(&h.store, "echo", true).await;

    let job = h
        .executor
        .create_job(CreateJobRequest::new(config.id, "response.submitted"))
        .await
        .unwrap();
    wait_for_status(&h.executor, job.id, JobStatus::Completed).await;
    wait_until("completed event", move || async move { h.bus.count_for(COMPLETED, job.id) == 1 }).await;

    h.executor
        .handle_job_completion(job.id, json!({"again": true}))
        .await;

    assert_eq!(h.executor.execution_logs(job.id).await.unwrap().len(), 1);
    assert_eq!(h.bus.count_for(COMPLETED, job.id), 1);
}

#[tokio::test]
async fn test_outcomes_for_unknown_job_are_ignored() {
    let h = &harness(PluginRegistry::new(), fast_config());
    let ghost = Uuid::now_v7();

    h.executor.handle_job_completion(ghost, json!({})).await;
    h.executor
        .handle_job_failure(ghost, JobFailure::new("boom"), 10)
        .await;

    assert!(h.bus.events().is_empty());
    assert!(h.store.all_jobs().await.is_empty());
}

#[tokio::test]
async fn test_failure_for_finished_job_is_ignored() {
    let h = &harness(PluginRegistry::new(), fast_config());
    let mut job = stored_job(Uuid::now_v7(), JobStatus::Completed, 0);
    job.completed_at = Some(Utc::now());
    h.store.insert_job(job.clone()).await;

    h.executor
        .handle_job_failure(job.id, JobFailure::new("late"), 5)
        .await;

    let unchanged = h.executor.job(job.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, JobStatus::Completed);
    assert!(unchanged.last_error.is_none());
    assert!(h.executor.execution_logs(job.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_late_failure_after_shutdown_keeps_attempts() {
    let h = &harness(PluginRegistry::new(), fast_config());
    let job = stored_job(Uuid::now_v7(), JobStatus::Running, 1);
    h.store.insert_job(job.clone()).await;

    assert_eq!(h.executor.graceful_shutdown().await.unwrap(), 1);

    // The plugin task outlived shutdown and reports afterwards.
    h.executor
        .handle_job_failure(job.id, JobFailure::new("late"), 5)
        .await;
    h.executor
        .handle_job_completion(job.id, json!({"late": true}))
        .await;

    let reset = h.executor.job(job.id).await.unwrap().unwrap();
    assert_eq!(reset.status, JobStatus::Pending);
    assert_eq!(reset.attempts, 1);
    assert!(reset.last_error.is_none());
    assert!(reset.started_at.is_none());
    assert!(h.executor.execution_logs(job.id).await.unwrap().is_empty());
    assert!(h.bus.events().is_empty());
}

#[tokio::test]
async fn test_failure_for_pending_job_is_ignored() {
    let h = &harness(PluginRegistry::new(), fast_config());
    let job = stored_job(Uuid::now_v7(), JobStatus::Pending, 0);
    h.store.insert_job(job.clone()).await;

    h.executor
        .handle_job_failure(job.id, JobFailure::new("stray"), 5)
        .await;

    let unchanged = h.executor.job(job.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, JobStatus::Pending);
    assert_eq!(unchanged.attempts, 0);
    assert_eq!(unchanged.scheduled_for, job.scheduled_for);
    assert_eq!(h.bus.count_for(CREATED, job.id), 0);
}

#[tokio::test]
async fn test_failure_storage_error_is_swallowed() {
    let h = &harness(PluginRegistry::new(), fast_config());
    let job = stored_job(Uuid::now_v7(), JobStatus::Running, 0);
    h.store.insert_job(job.clone()).await;

    h.store.fail_writes(true);
    h.executor
        .handle_job_failure(job.id, JobFailure::new("boom"), 5)
        .await;
    h.store.fail_writes(false);

    let still_running = h.executor.job(job.id).await.unwrap().unwrap();
    assert_eq!(still_running.status, JobStatus::Running);
    assert_eq!(still_running.attempts, 0);
    assert!(h.bus.events().is_empty());
}

#[tokio::test]
async fn test_deferred_plugin_reports_through_context() {
    struct Later;

    #[async_trait]
    impl PluginHandler for Later {
        fn plugin_id(&self) -> &str {
            "later"
        }

        async fn execute(&self, ctx: PluginContext) -> PluginOutcome {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let event = ctx.request.event().to_string();
                ctx.complete(json!({"acknowledged": event})).await;
            });
            PluginOutcome::Deferred
        }
    }

    let h = &harness(PluginRegistry::new().with_handler(Later).unwrap(), fast_config());
    let config = plugin_config(&h.store, "later", true).await;
    let job = h
        .executor
        .create_job(CreateJobRequest::new(config.id, "form.closed"))
        .await
        .unwrap();

    wait_until("job running", move || async move {
        matches!(h.executor.job(job.id).await, Ok(Some(j)) if j.status != JobStatus::Pending)
    })
    .await;
    let done = wait_for_status(&h.executor, job.id, JobStatus::Completed).await;
    assert!(done.completed_at.is_some());

    wait_until("success log", move || async move {
        h.executor.execution_logs(job.id).await.unwrap().len() == 1
    })
    .await;
    let logs = h.executor.execution_logs(job.id).await.unwrap();
    assert_eq!(logs[0].output_data, Some(json!({"acknowledged": "form.closed"})));
}

#[tokio::test]
async fn test_execute_skips_job_that_is_not_pending() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = PluginRegistry::new()
        .with_handler(echo_handler("echo", calls.clone()))
        .unwrap();
    let h = &harness(registry, fast_config());
    let config = plugin_config(&h.store, "echo", true).await;
    let job = stored_job(config.id, JobStatus::Running, 0);
    h.store.insert_job(job.clone()).await;

    h.executor.execute_job(job.clone()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(h.bus.named("plugin.echo.execute").is_empty());
    let unchanged = h.executor.job(job.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, JobStatus::Running);
}

// =============================================================================
// CREATION / DISPATCH
// =============================================================================

#[tokio::test]
async fn test_create_job_validates_input() {
    let h = &harness(PluginRegistry::new(), fast_config());
    let config_id = Uuid::now_v7();

    let err = h
        .executor
        .create_job(CreateJobRequest::new(config_id, "  "))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    let err = h
        .executor
        .create_job(CreateJobRequest::new(config_id, "response.submitted").with_max_attempts(0))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));

    assert!(h.store.all_jobs().await.is_empty());
}

#[tokio::test]
async fn test_create_job_propagates_persistence_failure() {
    let h = &harness(PluginRegistry::new(), fast_config());
    h.store.fail_writes(true);
    let err = h
        .executor
        .create_job(CreateJobRequest::new(Uuid::now_v7(), "response.submitted"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Database(_)));
}

#[tokio::test]
async fn test_create_job_survives_scheduling_failure() {
    let h = &harness(PluginRegistry::new(), fast_config());
    h.store.fail_reads(true);

    let job = h
        .executor
        .create_job(CreateJobRequest::new(Uuid::now_v7(), "response.submitted"))
        .await
        .unwrap();
    assert!(h.bus.events().is_empty());

    h.store.fail_reads(false);
    let stored = h.executor.job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_job_name_and_execute_event() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = PluginRegistry::new()
        .with_handler(echo_handler("echo", calls))
        .unwrap();
    let h = &harness(registry, fast_config());
    let config = plugin_config(&h.store, "echo", true).await;

    let mut data = Map::new();
    data.insert("response_id".to_string(), json!("r-1"));
    let job = h
        .executor
        .create_job(CreateJobRequest::new(config.id, "response.submitted").with_data(data))
        .await
        .unwrap();

    let prefix = format!("response.submitted:{}:", formplug_jobs::short_id(&config.id));
    assert!(job.job_name.starts_with(&prefix), "{}", job.job_name);
    assert!(job.job_name.ends_with('Z'));

    wait_until("execute event", move || async move {
        !h.bus.named("plugin.echo.execute").is_empty()
    })
    .await;
    match &h.bus.named("plugin.echo.execute")[0] {
        PluginEvent::Execute {
            job_id,
            plugin_config_id,
            form_id,
            config: settings,
            payload,
            event,
            ..
        } => {
            assert_eq!(*job_id, job.id);
            assert_eq!(*plugin_config_id, config.id);
            assert_eq!(*form_id, config.form_id);
            assert_eq!(settings["url"], json!("https://hooks.example.test/form"));
            assert_eq!(payload["data"]["response_id"], json!("r-1"));
            assert_eq!(event, "response.submitted");
        }
        other => panic!("unexpected event {other:?}"),
    }

    match &h.bus.named(CREATED)[0] {
        PluginEvent::JobCreated { plugin_id, .. } => {
            assert_eq!(plugin_id.as_deref(), Some("echo"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_future_job_waits_for_scheduled_time() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = PluginRegistry::new()
        .with_handler(NoOpHandler::new("noop"))
        .unwrap()
        .with_handler(echo_handler("echo", calls.clone()))
        .unwrap();
    let h = &harness(registry, fast_config());
    let config = plugin_config(&h.store, "echo", true).await;

    let job = h
        .executor
        .create_job(
            CreateJobRequest::new(config.id, "response.submitted")
                .with_scheduled_for(Utc::now() + chrono::Duration::milliseconds(300)),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let waiting = h.executor.job(job.id).await.unwrap().unwrap();
    assert_eq!(waiting.status, JobStatus::Pending);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    wait_for_status(&h.executor, job.id, JobStatus::Completed).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_event_bus_subscribers_see_lifecycle() {
    let registry = PluginRegistry::new()
        .with_handler(NoOpHandler::new("noop"))
        .unwrap();
    let h = &harness(registry, fast_config());
    let mut rx = h.executor.events();
    let config = plugin_config(&h.store, "noop", true).await;

    let job = h
        .executor
        .create_job(CreateJobRequest::new(config.id, "response.deleted"))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event within timeout")
            .expect("bus open");
        assert_eq!(envelope.payload.job_id(), job.id);
        seen.push(envelope.event_type);
    }
    assert_eq!(
        seen,
        vec![
            "plugin.job.created".to_string(),
            "plugin.noop.execute".to_string(),
            "plugin.job.completed".to_string()
        ]
    );
}
