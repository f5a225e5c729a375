use serde::Serialize;
use tokio::sync::broadcast;

use crate::chat::SessionSummary;
use crate::models::ModelStatus;

pub const EVENT_MODEL_STATUS: &str = "model-status";
pub const EVENT_SESSIONS_CHANGED: &str = "sessions-changed";
pub const EVENT_WARNING: &str = "warning";

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatusPayload {
    pub id: String,
    pub status: ModelStatus,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum AppEvent {
    ModelStatus(ModelStatusPayload),
    SessionsChanged(Vec<SessionSummary>),
    Warning(String),
}

impl AppEvent {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ModelStatus(_) => EVENT_MODEL_STATUS,
            Self::SessionsChanged(_) => EVENT_SESSIONS_CHANGED,
            Self::Warning(_) => EVENT_WARNING,
        }
    }
}

/// Fan-out of state changes to whoever is observing (the REPL, tests).
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AppEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    fn emit(&self, event: AppEvent) {
        tracing::trace!(event = event.name(), "emit");
        // No receivers is fine.
        let _ = self.sender.send(event);
    }
}

pub fn emit_model_status(bus: &EventBus, id: &str, status: ModelStatus) {
    bus.emit(AppEvent::ModelStatus(ModelStatusPayload {
        id: id.to_string(),
        status,
    }));
}

pub fn emit_sessions_changed(bus: &EventBus, summaries: Vec<SessionSummary>) {
    bus.emit(AppEvent::SessionsChanged(summaries));
}

pub fn emit_warning(bus: &EventBus, message: impl Into<String>) {
    bus.emit(AppEvent::Warning(message.into()));
}
