//! formplug plugin job worker.
//!
//! Connects to PostgreSQL, recovers jobs left over from the previous run,
//! executes plugin jobs until SIGINT/SIGTERM, then resets in-flight jobs so
//! the next start picks them up.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use formplug_db::{log_pool_metrics, Database, PoolConfig};
use formplug_jobs::{BroadcastEventBus, EventBus, ExecutorBuilder, ExecutorConfig, PluginRegistry};
use formplug_worker::{telemetry_mirror, WebhookPlugin, WorkerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let _file_guard = init_tracing();

    let settings = WorkerSettings::from_env();
    let executor_config = ExecutorConfig::from_env();

    info!("Connecting to database...");
    let db = Database::connect(&settings.database_url, PoolConfig::from_env()).await?;
    log_pool_metrics(db.pool());

    info!("Running database migrations...");
    db.migrate().await?;
    info!("Database migrations complete");

    let registry =
        PluginRegistry::new().with_handler(WebhookPlugin::new(settings.webhook_timeout)?)?;
    for descriptor in registry.descriptors() {
        info!(
            plugin_id = %descriptor.plugin_id,
            description = %descriptor.description,
            "Plugin registered"
        );
    }

    let event_bus = Arc::new(BroadcastEventBus::new(settings.event_bus_capacity));
    tokio::spawn(telemetry_mirror(event_bus.subscribe()));

    let executor = ExecutorBuilder::from_database(&db)
        .with_config(executor_config)
        .with_event_bus(event_bus.clone())
        .with_registry(registry)
        .build();

    let report = executor.initialize().await?;
    info!(
        recovered = report.recovered,
        scheduled = report.scheduled,
        deferred = report.deferred,
        failed = report.failed,
        "Startup recovery complete"
    );
    executor.spawn_watchdog();

    shutdown_signal().await;
    info!("Shutdown signal received");

    let reset = executor.graceful_shutdown().await?;
    info!(reset, "Running jobs returned to pending");

    db.pool().close().await;
    info!("formplug-worker stopped");
    Ok(())
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables daily-rotated file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "formplug=info")
///
/// The returned guard must live as long as the process so buffered file
/// output is flushed.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "formplug=info,formplug_worker=info,formplug_jobs=info,formplug_db=info".into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("formplug-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
