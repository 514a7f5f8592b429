use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What starts a run of this workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Scheduled,
    RowAdded,
    RowUpdated,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::RowAdded => "row_added",
            Self::RowUpdated => "row_updated",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "scheduled" => Self::Scheduled,
            "row_added" => Self::RowAdded,
            "row_updated" => Self::RowUpdated,
            _ => Self::Manual,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Active,
    Archived,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "archived" => Self::Archived,
            _ => Self::Active,
        }
    }
}

/// Whether a step auto-advances after its task succeeds, or waits for an
/// explicit human approval first. Fixed at definition time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepGate {
    #[default]
    Auto,
    Approval,
}

impl StepGate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Approval => "approval",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "approval" => Self::Approval,
            _ => Self::Auto,
        }
    }
}

/// Structured per-step configuration, persisted as a JSON column.
///
/// Modeled as a typed record rather than an opaque blob so malformed config
/// is rejected at save time instead of failing mid-run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    /// Skill identifiers attached to the dispatched task.
    #[serde(default)]
    pub skills: Vec<String>,
    /// Freeform instructions text (may contain `{{...}}` placeholders).
    #[serde(default)]
    pub instructions: Option<String>,
    /// Name under which this step's task output is stored for later steps.
    /// Must be unique within the owning workflow.
    #[serde(default)]
    pub output_variable: Option<String>,
}

/// A declarative workflow definition: trigger configuration plus an ordered
/// list of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub trigger_kind: TriggerKind,
    /// Only for `scheduled` triggers: `daily:HH:MM` or `weekly:<day>:HH:MM`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_spec: Option<String>,
    /// Only for `row_added` / `row_updated` triggers: the watched table id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_table: Option<String>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One step of a workflow. Positions form a dense 0..n-1 sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    pub id: String,
    pub workflow_id: String,
    pub position: i64,
    pub title: String,
    /// May contain `{{...}}` interpolation placeholders.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Agent this step's task is assigned to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub gate: StepGate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<i64>,
    #[serde(default)]
    pub config: StepConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A workflow together with its ordered steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowWithSteps {
    #[serde(flatten)]
    pub workflow: Workflow,
    pub steps: Vec<StepDefinition>,
}

/// Input for creating a new workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkflowInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_trigger_kind")]
    pub trigger_kind: TriggerKind,
    pub schedule_spec: Option<String>,
    pub source_table: Option<String>,
}

fn default_trigger_kind() -> TriggerKind {
    TriggerKind::Manual
}

/// Partial update input for a workflow.
///
/// `schedule_spec` and `source_table` are double-optional: the outer `None`
/// leaves the field unchanged, `Some(None)` clears it (e.g. when switching a
/// scheduled workflow back to manual), `Some(Some(v))` sets it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWorkflowInput {
    pub name: Option<String>,
    pub description: Option<String>,
    pub trigger_kind: Option<TriggerKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_spec: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_table: Option<Option<String>>,
    pub status: Option<WorkflowStatus>,
}

/// Input for appending a step to a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStepInput {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub gate: StepGate,
    #[serde(default)]
    pub timeout_minutes: Option<i64>,
    #[serde(default)]
    pub config: StepConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_kind_round_trip() {
        for kind in [
            TriggerKind::Manual,
            TriggerKind::Scheduled,
            TriggerKind::RowAdded,
            TriggerKind::RowUpdated,
        ] {
            assert_eq!(TriggerKind::from_str(kind.as_str()), kind);
        }
        assert_eq!(TriggerKind::from_str("garbage"), TriggerKind::Manual);
    }

    #[test]
    fn test_step_config_defaults() {
        let config: StepConfig = serde_json::from_str("{}").unwrap();
        assert!(config.skills.is_empty());
        assert!(config.instructions.is_none());
        assert!(config.output_variable.is_none());

        let config: StepConfig = serde_json::from_str(
            r#"{"skills":["search"],"instructions":"do {{row.Name}}","outputVariable":"result"}"#,
        )
        .unwrap();
        assert_eq!(config.skills, vec!["search"]);
        assert_eq!(config.output_variable.as_deref(), Some("result"));
    }
}
