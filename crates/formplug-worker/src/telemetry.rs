//! Mirrors bus events into structured logs.

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use formplug_jobs::{EventEnvelope, PluginEvent};

/// Log every event published on the bus until it closes.
pub async fn telemetry_mirror(mut rx: broadcast::Receiver<EventEnvelope>) {
    loop {
        match rx.recv().await {
            Ok(envelope) => log_event(&envelope),
            Err(RecvError::Lagged(n)) => {
                warn!(target: "formplug::events", missed = n, "Telemetry mirror lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_event(envelope: &EventEnvelope) {
    let event_type = envelope.event_type.as_str();
    match &envelope.payload {
        PluginEvent::JobCreated { job_id, plugin_id } => {
            debug!(
                target: "formplug::events",
                event = event_type,
                %job_id,
                plugin_id = plugin_id.as_deref().unwrap_or("<unknown>"),
                "Job scheduled"
            );
        }
        PluginEvent::Execute {
            job_id, plugin_id, ..
        } => {
            debug!(
                target: "formplug::events",
                event = event_type,
                %job_id, %plugin_id,
                "Job dispatched"
            );
        }
        PluginEvent::JobCompleted {
            job_id,
            execution_time,
            ..
        } => {
            info!(
                target: "formplug::events",
                event = event_type,
                %job_id, duration_ms = execution_time,
                "Job completed"
            );
        }
        PluginEvent::JobFailed { job_id, error } => {
            warn!(
                target: "formplug::events",
                event = event_type,
                %job_id, %error,
                "Job failed"
            );
        }
    }
}
