//! Run lifecycle event bus.
//!
//! The orchestrator publishes an event for every run/step transition on a
//! `tokio::sync::broadcast` channel. Consumers (SSE streams, WebSocket
//! bridges, loggers) subscribe; UI polling of run state remains possible but
//! is no longer the primary completion signal path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunEventType {
    RunStarted,
    StepStarted,
    StepAwaitingApproval,
    StepCompleted,
    StepFailed,
    RunCompleted,
    RunFailed,
    RunCanceled,
}

/// An event emitted on a run or run-step transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub event_type: RunEventType,
    pub run_id: String,
    pub workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_step_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast bus for run events. Cheap to clone; subscribers that fall
/// behind are lagged, not blocking.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: RunEvent) {
        tracing::debug!(
            "[EventBus] {:?} run={} step={:?}",
            event.event_type,
            event.run_id,
            event.run_step_id
        );
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
