//! Plugin lifecycle events, envelope schema, and event bus.
//!
//! The executor publishes lifecycle events (`plugin.job.*`) and one dispatch
//! event per execution (`plugin.<plugin_id>.execute`). Consumers (telemetry,
//! audit, external plugin runners) subscribe independently.
//!
//! The bus is a trait so the executor can run against the broadcast
//! implementation in production and against [`RecordingEventBus`] in tests,
//! with any number of isolated instances side by side.

use std::borrow::Cow;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use uuid::Uuid;

// ============================================================================
// Plugin Event (domain payloads)
// ============================================================================

/// Event published by the job executor.
///
/// Serialized with a `type` tag, e.g.
/// `{"type":"JobFailed","job_id":"...","error":"..."}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum PluginEvent {
    /// A job was accepted for asynchronous execution.
    JobCreated {
        job_id: Uuid,
        /// `None` when the job's plugin configuration could not be found.
        plugin_id: Option<String>,
    },
    /// A job was handed to its plugin.
    Execute {
        plugin_id: String,
        job_id: Uuid,
        plugin_config_id: Uuid,
        form_id: Uuid,
        config: JsonValue,
        payload: JsonValue,
        event: String,
    },
    /// A job reached `completed`.
    JobCompleted {
        job_id: Uuid,
        plugin_config_id: Uuid,
        event: String,
        result: JsonValue,
        execution_time: i64,
    },
    /// A job reached `failed` after exhausting its attempts.
    JobFailed { job_id: Uuid, error: String },
}

impl PluginEvent {
    /// Returns the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            PluginEvent::JobCreated { .. } => "JobCreated",
            PluginEvent::Execute { .. } => "Execute",
            PluginEvent::JobCompleted { .. } => "JobCompleted",
            PluginEvent::JobFailed { .. } => "JobFailed",
        }
    }

    /// Returns the namespaced event name (e.g. `"plugin.job.completed"`).
    pub fn event_name(&self) -> Cow<'static, str> {
        match self {
            PluginEvent::JobCreated { .. } => Cow::Borrowed("plugin.job.created"),
            PluginEvent::Execute { plugin_id, .. } => {
                Cow::Owned(format!("plugin.{plugin_id}.execute"))
            }
            PluginEvent::JobCompleted { .. } => Cow::Borrowed("plugin.job.completed"),
            PluginEvent::JobFailed { .. } => Cow::Borrowed("plugin.job.failed"),
        }
    }

    /// Returns the job this event relates to.
    pub fn job_id(&self) -> Uuid {
        match self {
            PluginEvent::JobCreated { job_id, .. }
            | PluginEvent::Execute { job_id, .. }
            | PluginEvent::JobCompleted { job_id, .. }
            | PluginEvent::JobFailed { job_id, .. } => *job_id,
        }
    }
}

// ============================================================================
// Event Envelope
// ============================================================================

/// Versioned wrapper around a [`PluginEvent`].
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Unique event identifier (UUIDv7 for temporal ordering).
    pub event_id: Uuid,
    /// Namespaced event name (e.g. `"plugin.job.failed"`).
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    /// Payload schema version.
    pub payload_version: u32,
    pub payload: PluginEvent,
}

impl EventEnvelope {
    pub fn new(event: PluginEvent) -> Self {
        Self {
            event_id: crate::uuid_utils::new_v7(),
            event_type: event.event_name().into_owned(),
            occurred_at: Utc::now(),
            payload_version: 1,
            payload: event,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Publish/subscribe channel used by the executor.
pub trait EventBus: Send + Sync {
    /// Fire-and-forget publish. Never blocks and never fails; events with no
    /// subscriber are dropped.
    fn publish(&self, event: PluginEvent);

    /// Subscribe to all events published after this call.
    fn subscribe(&self) -> broadcast::Receiver<EventEnvelope>;
}

/// Broadcast-based event bus.
///
/// Uses `tokio::sync::broadcast`. Slow receivers that fall behind receive a
/// `Lagged` error and miss events.
pub struct BroadcastEventBus {
    tx: broadcast::Sender<EventEnvelope>,
}

impl BroadcastEventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(crate::defaults::EVENT_BUS_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: PluginEvent) {
        let envelope = EventEnvelope::new(event);
        tracing::trace!(
            event_type = %envelope.event_type,
            event_id = %envelope.event_id,
            subscriber_count = self.tx.receiver_count(),
            "EventBus publish"
        );
        let _ = self.tx.send(envelope);
    }

    fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

/// Event bus that records every published event.
///
/// Forwards to an inner broadcast channel so subscribers still work.
#[derive(Default)]
pub struct RecordingEventBus {
    inner: BroadcastEventBus,
    events: Mutex<Vec<PluginEvent>>,
}

impl RecordingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far.
    pub fn events(&self) -> Vec<PluginEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events with the given namespaced name.
    pub fn named(&self, name: &str) -> Vec<PluginEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_name() == name)
            .collect()
    }

    /// Number of events with the given name for one job.
    pub fn count_for(&self, name: &str, job_id: Uuid) -> usize {
        self.named(name)
            .iter()
            .filter(|e| e.job_id() == job_id)
            .count()
    }
}

impl EventBus for RecordingEventBus {
    fn publish(&self, event: PluginEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        self.inner.publish(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.inner.subscribe()
    }
}

// ============================================================================
// Tests
// ============================================================================
