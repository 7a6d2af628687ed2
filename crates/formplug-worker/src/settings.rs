//! Process-level settings read from the environment.

use std::time::Duration;

use formplug_jobs::defaults;

/// Settings for the worker process itself.
///
/// Executor tuning lives in `ExecutorConfig::from_env` and pool tuning in
/// `PoolConfig::from_env`.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub database_url: String,
    pub event_bus_capacity: usize,
    pub webhook_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            database_url: defaults::DATABASE_URL.to_string(),
            event_bus_capacity: defaults::EVENT_BUS_CAPACITY,
            webhook_timeout: Duration::from_secs(defaults::WEBHOOK_TIMEOUT_SECS),
        }
    }
}

impl WorkerSettings {
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DATABASE_URL` | `postgres://localhost/formplug` |
    /// | `EVENT_BUS_CAPACITY` | `256` |
    /// | `WEBHOOK_TIMEOUT_SECS` | `10` |
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(url) = std::env::var("DATABASE_URL") {
            settings.database_url = url;
        }
        if let Some(capacity) = std::env::var("EVENT_BUS_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            settings.event_bus_capacity = capacity.max(1);
        }
        if let Some(secs) = std::env::var("WEBHOOK_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            settings.webhook_timeout = Duration::from_secs(secs.max(1));
        }
        settings
    }
}
