use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::variables::VariableContext;
use crate::models::workflow::{StepConfig, StepDefinition, StepGate};

/// Run-level status. `completed`, `failed` and `canceled` are terminal;
/// no transition ever leaves a terminal state. A run with a step sitting
/// `awaiting_approval` stays `running` — approval is routine, not exceptional.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            _ => Self::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStepStatus {
    Pending,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Skipped,
}

impl RunStepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "awaiting_approval" => Self::AwaitingApproval,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// One execution instance of a workflow.
///
/// The step list is created in full at run start and never mutates; only
/// step statuses and the run status change afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Run-scoped variable context, seeded from the trigger and extended
    /// with step outputs. Persisted so advancement survives restarts.
    #[serde(default)]
    pub variables: VariableContext,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(workflow_id: String, variables: VariableContext) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id,
            status: RunStatus::Running,
            error: None,
            variables,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// The execution record for one step definition within a specific run.
///
/// Carries a snapshot of the definition (gate, agent, timeout, config) taken
/// at run creation. Editing or deleting the definition afterwards never
/// changes how this run executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStep {
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    pub position: i64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub gate: StepGate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<i64>,
    #[serde(default)]
    pub config: StepConfig,
    pub status: RunStepStatus,
    /// External task reference once dispatched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Textual result of the underlying task, held for the output variable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Absolute timeout deadline, set when the step enters `running`.
    /// Steps awaiting approval carry no deadline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_at: Option<DateTime<Utc>>,
}

impl RunStep {
    pub fn from_definition(run_id: String, definition: &StepDefinition) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            step_id: definition.id.clone(),
            position: definition.position,
            title: definition.title.clone(),
            description: definition.description.clone(),
            agent_id: definition.agent_id.clone(),
            gate: definition.gate,
            timeout_minutes: definition.timeout_minutes,
            config: definition.config.clone(),
            status: RunStepStatus::Pending,
            task_id: None,
            output: None,
            error: None,
            started_at: None,
            deadline_at: None,
        }
    }
}

/// A run together with its ordered step records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunWithSteps {
    #[serde(flatten)]
    pub run: WorkflowRun,
    pub steps: Vec<RunStep>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Canceled.is_terminal());

        assert!(!RunStepStatus::Pending.is_terminal());
        assert!(!RunStepStatus::Running.is_terminal());
        assert!(!RunStepStatus::AwaitingApproval.is_terminal());
        assert!(RunStepStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_run_step_status_round_trip() {
        for status in [
            RunStepStatus::Pending,
            RunStepStatus::Running,
            RunStepStatus::AwaitingApproval,
            RunStepStatus::Completed,
            RunStepStatus::Failed,
            RunStepStatus::Skipped,
        ] {
            assert_eq!(RunStepStatus::from_str(status.as_str()), status);
        }
    }
}
