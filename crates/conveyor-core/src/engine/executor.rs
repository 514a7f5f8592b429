//! Step Executor boundary — turns a step definition plus interpolated text
//! into an external unit of work.
//!
//! `begin` either returns a handle for asynchronous completion or an
//! immediate dispatch failure (e.g. no agent assignable). Completion is
//! delivered back to the orchestrator as a `TaskSignal` on an mpsc channel:
//! whatever adapter fronts the task system (webhook receiver, poller) pushes
//! signals into that channel. The approval gate is a property of the step
//! definition, applied by the orchestrator — the executor never decides it.

use serde::{Deserialize, Serialize};

/// Everything the task system needs to start one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub run_id: String,
    pub run_step_id: String,
    /// Assigned agent, if the step declares one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub title: String,
    /// Step description + instructions, already interpolated.
    pub instructions: String,
    #[serde(default)]
    pub skills: Vec<String>,
}

/// Reference to a dispatched unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHandle {
    pub task_id: String,
}

/// Terminal outcome reported by the task system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum TaskOutcome {
    Succeeded { output: String },
    Failed { error: String },
}

/// A completion signal for a previously dispatched task.
///
/// Delivery may be duplicated; the orchestrator treats signals for an
/// already-terminal step as no-ops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSignal {
    pub task_id: String,
    #[serde(flatten)]
    pub outcome: TaskOutcome,
}

/// The bridge between a step and the external task/agent system.
#[async_trait::async_trait]
pub trait StepExecutor: Send + Sync {
    /// Create a task for the step's agent. An `Err` is a synchronous
    /// dispatch failure and immediately fails the step.
    async fn begin(&self, request: &DispatchRequest) -> Result<TaskHandle, String>;
}
