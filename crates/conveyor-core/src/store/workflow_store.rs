//! Persistence for workflow definitions and their steps.
//!
//! Definition-level validation lives here: trigger configuration must match
//! the trigger kind, and output-variable names must be unique within a
//! workflow. Both are rejected at save time, never at run time.

use chrono::Utc;
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::workflow::{
    CreateStepInput, CreateWorkflowInput, StepConfig, StepDefinition, StepGate, TriggerKind,
    UpdateWorkflowInput, Workflow, WorkflowStatus, WorkflowWithSteps,
};
use crate::triggers::schedule::ScheduleSpec;

#[derive(Clone)]
pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, input: CreateWorkflowInput) -> Result<Workflow, EngineError> {
        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::new_v4().to_string(),
            name: input.name,
            description: input.description,
            trigger_kind: input.trigger_kind,
            schedule_spec: input.schedule_spec,
            source_table: input.source_table,
            status: WorkflowStatus::Active,
            created_at: now,
            updated_at: now,
        };
        validate_trigger(&workflow)?;

        let w = workflow.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflows (id, name, description, trigger_kind, schedule_spec, \
                     source_table, status, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        w.id,
                        w.name,
                        w.description,
                        w.trigger_kind.as_str(),
                        w.schedule_spec,
                        w.source_table,
                        w.status.as_str(),
                        w.created_at.timestamp_millis(),
                        w.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(workflow)
    }

    pub async fn update(
        &self,
        id: &str,
        input: UpdateWorkflowInput,
    ) -> Result<Option<Workflow>, EngineError> {
        // Fetch first, then apply patches, then save
        let existing = self.get(id).await?;
        let Some(mut w) = existing else { return Ok(None) };
        if let Some(v) = input.name {
            w.name = v;
        }
        if let Some(v) = input.description {
            w.description = v;
        }
        if let Some(v) = input.trigger_kind {
            w.trigger_kind = v;
        }
        if let Some(v) = input.schedule_spec {
            w.schedule_spec = v;
        }
        if let Some(v) = input.source_table {
            w.source_table = v;
        }
        if let Some(v) = input.status {
            w.status = v;
        }
        w.updated_at = Utc::now();
        validate_trigger(&w)?;

        let wc = w.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE workflows SET name=?2, description=?3, trigger_kind=?4, \
                     schedule_spec=?5, source_table=?6, status=?7, updated_at=?8 WHERE id=?1",
                    rusqlite::params![
                        wc.id,
                        wc.name,
                        wc.description,
                        wc.trigger_kind.as_str(),
                        wc.schedule_spec,
                        wc.source_table,
                        wc.status.as_str(),
                        wc.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(Some(w))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Workflow>, EngineError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, name, description, trigger_kind, schedule_spec, source_table, \
                     status, created_at, updated_at FROM workflows WHERE id = ?1",
                    rusqlite::params![id],
                    |row| Ok(row_to_workflow(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn get_with_steps(&self, id: &str) -> Result<Option<WorkflowWithSteps>, EngineError> {
        let Some(workflow) = self.get(id).await? else {
            return Ok(None);
        };
        let steps = self.steps(id).await?;
        Ok(Some(WorkflowWithSteps { workflow, steps }))
    }

    pub async fn list(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<Workflow>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let sql = match status {
                    Some(_) => {
                        "SELECT id, name, description, trigger_kind, schedule_spec, source_table, \
                         status, created_at, updated_at FROM workflows WHERE status = ?1 \
                         ORDER BY created_at DESC"
                    }
                    None => {
                        "SELECT id, name, description, trigger_kind, schedule_spec, source_table, \
                         status, created_at, updated_at FROM workflows ORDER BY created_at DESC"
                    }
                };
                let mut stmt = conn.prepare(sql)?;
                let rows = match status {
                    Some(s) => stmt
                        .query_map(rusqlite::params![s.as_str()], |row| Ok(row_to_workflow(row)))?
                        .collect::<Result<Vec<_>, _>>()?,
                    None => stmt
                        .query_map([], |row| Ok(row_to_workflow(row)))?
                        .collect::<Result<Vec<_>, _>>()?,
                };
                Ok(rows)
            })
            .await
    }

    /// Active workflows with the given trigger kind (scheduler / mutation feed).
    pub async fn list_active_by_trigger(
        &self,
        kind: TriggerKind,
    ) -> Result<Vec<Workflow>, EngineError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, trigger_kind, schedule_spec, source_table, \
                     status, created_at, updated_at FROM workflows \
                     WHERE status = 'active' AND trigger_kind = ?1 ORDER BY created_at",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![kind.as_str()], |row| {
                        Ok(row_to_workflow(row))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn steps(&self, workflow_id: &str) -> Result<Vec<StepDefinition>, EngineError> {
        let wid = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, workflow_id, position, title, description, agent_id, gate, \
                     timeout_minutes, config, created_at, updated_at \
                     FROM workflow_steps WHERE workflow_id = ?1 ORDER BY position",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![wid], |row| Ok(row_to_step(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Append a step at the end of the workflow.
    ///
    /// Rejects an output-variable name already declared by another step of
    /// the same workflow.
    pub async fn add_step(
        &self,
        workflow_id: &str,
        input: CreateStepInput,
    ) -> Result<StepDefinition, EngineError> {
        let Some(_) = self.get(workflow_id).await? else {
            return Err(EngineError::NotFound(format!(
                "Workflow {} not found",
                workflow_id
            )));
        };
        let existing = self.steps(workflow_id).await?;

        if let Some(ref name) = input.config.output_variable {
            let duplicate = existing
                .iter()
                .any(|s| s.config.output_variable.as_deref() == Some(name.as_str()));
            if duplicate {
                return Err(EngineError::InvalidDefinition(format!(
                    "Output variable \"{}\" is already declared by another step",
                    name
                )));
            }
        }

        let now = Utc::now();
        let step = StepDefinition {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            position: existing.len() as i64,
            title: input.title,
            description: input.description,
            agent_id: input.agent_id,
            gate: input.gate,
            timeout_minutes: input.timeout_minutes,
            config: input.config,
            created_at: now,
            updated_at: now,
        };

        let s = step.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_steps (id, workflow_id, position, title, description, \
                     agent_id, gate, timeout_minutes, config, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        s.id,
                        s.workflow_id,
                        s.position,
                        s.title,
                        s.description,
                        s.agent_id,
                        s.gate.as_str(),
                        s.timeout_minutes,
                        serde_json::to_string(&s.config).unwrap_or_else(|_| "{}".to_string()),
                        s.created_at.timestamp_millis(),
                        s.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(step)
    }

    /// Delete a step and re-densify the remaining positions to 0..n-1.
    /// In-flight runs are unaffected; they execute their own snapshot.
    pub async fn delete_step(&self, step_id: &str) -> Result<bool, EngineError> {
        let id = step_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let workflow_id: Option<String> = tx
                    .query_row(
                        "SELECT workflow_id FROM workflow_steps WHERE id = ?1",
                        rusqlite::params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(workflow_id) = workflow_id else {
                    return Ok(false);
                };
                tx.execute(
                    "DELETE FROM workflow_steps WHERE id = ?1",
                    rusqlite::params![id],
                )?;
                let remaining: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM workflow_steps WHERE workflow_id = ?1 ORDER BY position",
                    )?;
                    let ids = stmt
                        .query_map(rusqlite::params![workflow_id], |row| row.get(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    ids
                };
                for (position, sid) in remaining.iter().enumerate() {
                    tx.execute(
                        "UPDATE workflow_steps SET position = ?1 WHERE id = ?2",
                        rusqlite::params![position as i64, sid],
                    )?;
                }
                tx.commit()?;
                Ok(true)
            })
            .await
    }
}

fn validate_trigger(workflow: &Workflow) -> Result<(), EngineError> {
    match workflow.trigger_kind {
        TriggerKind::Scheduled => {
            let Some(ref spec) = workflow.schedule_spec else {
                return Err(EngineError::InvalidDefinition(
                    "Scheduled workflows require a schedule spec".to_string(),
                ));
            };
            ScheduleSpec::parse(spec).map_err(EngineError::InvalidDefinition)?;
        }
        TriggerKind::RowAdded | TriggerKind::RowUpdated => {
            if workflow.source_table.is_none() {
                return Err(EngineError::InvalidDefinition(
                    "Row-triggered workflows require a source table".to_string(),
                ));
            }
        }
        TriggerKind::Manual => {}
    }
    Ok(())
}

fn row_to_workflow(row: &rusqlite::Row<'_>) -> Workflow {
    let created_ms: i64 = row.get(7).unwrap_or(0);
    let updated_ms: i64 = row.get(8).unwrap_or(0);

    Workflow {
        id: row.get(0).unwrap_or_default(),
        name: row.get(1).unwrap_or_default(),
        description: row.get(2).unwrap_or_default(),
        trigger_kind: TriggerKind::from_str(&row.get::<_, String>(3).unwrap_or_default()),
        schedule_spec: row.get(4).unwrap_or(None),
        source_table: row.get(5).unwrap_or(None),
        status: WorkflowStatus::from_str(&row.get::<_, String>(6).unwrap_or_default()),
        created_at: chrono::DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now),
        updated_at: chrono::DateTime::from_timestamp_millis(updated_ms).unwrap_or_else(Utc::now),
    }
}

fn row_to_step(row: &rusqlite::Row<'_>) -> StepDefinition {
    let config_str: String = row.get(8).unwrap_or_default();
    let config: StepConfig = serde_json::from_str(&config_str).unwrap_or_default();
    let created_ms: i64 = row.get(9).unwrap_or(0);
    let updated_ms: i64 = row.get(10).unwrap_or(0);

    StepDefinition {
        id: row.get(0).unwrap_or_default(),
        workflow_id: row.get(1).unwrap_or_default(),
        position: row.get(2).unwrap_or(0),
        title: row.get(3).unwrap_or_default(),
        description: row.get(4).unwrap_or(None),
        agent_id: row.get(5).unwrap_or(None),
        gate: StepGate::from_str(&row.get::<_, String>(6).unwrap_or_default()),
        timeout_minutes: row.get(7).unwrap_or(None),
        config,
        created_at: chrono::DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now),
        updated_at: chrono::DateTime::from_timestamp_millis(updated_ms).unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_workflow() -> CreateWorkflowInput {
        CreateWorkflowInput {
            name: "Deal intake".to_string(),
            description: String::new(),
            trigger_kind: TriggerKind::Manual,
            schedule_spec: None,
            source_table: None,
        }
    }

    fn step(title: &str, output_variable: Option<&str>) -> CreateStepInput {
        CreateStepInput {
            title: title.to_string(),
            description: None,
            agent_id: Some("agent-1".to_string()),
            gate: StepGate::Auto,
            timeout_minutes: None,
            config: StepConfig {
                skills: vec![],
                instructions: None,
                output_variable: output_variable.map(|s| s.to_string()),
            },
        }
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let db = Database::open_in_memory().unwrap();
        let store = WorkflowStore::new(db);

        let w = store.create(manual_workflow()).await.unwrap();
        assert_eq!(w.status, WorkflowStatus::Active);

        let all = store.list(None).await.unwrap();
        assert_eq!(all.len(), 1);

        store
            .update(
                &w.id,
                UpdateWorkflowInput {
                    status: Some(WorkflowStatus::Archived),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let active = store.list(Some(WorkflowStatus::Active)).await.unwrap();
        assert!(active.is_empty());
        let archived = store.list(Some(WorkflowStatus::Archived)).await.unwrap();
        assert_eq!(archived.len(), 1);
    }

    #[tokio::test]
    async fn test_scheduled_trigger_requires_valid_spec() {
        let db = Database::open_in_memory().unwrap();
        let store = WorkflowStore::new(db);

        let mut input = manual_workflow();
        input.trigger_kind = TriggerKind::Scheduled;
        assert!(matches!(
            store.create(input.clone()).await,
            Err(EngineError::InvalidDefinition(_))
        ));

        input.schedule_spec = Some("daily:99:00".to_string());
        assert!(matches!(
            store.create(input.clone()).await,
            Err(EngineError::InvalidDefinition(_))
        ));

        input.schedule_spec = Some("daily:09:30".to_string());
        assert!(store.create(input).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_can_clear_trigger_fields() {
        let db = Database::open_in_memory().unwrap();
        let store = WorkflowStore::new(db);

        let mut input = manual_workflow();
        input.trigger_kind = TriggerKind::Scheduled;
        input.schedule_spec = Some("daily:09:30".to_string());
        let w = store.create(input).await.unwrap();

        // Switch to manual and drop the stale spec in one update.
        let w = store
            .update(
                &w.id,
                UpdateWorkflowInput {
                    trigger_kind: Some(TriggerKind::Manual),
                    schedule_spec: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(w.trigger_kind, TriggerKind::Manual);
        assert!(w.schedule_spec.is_none());

        // Outer None leaves the field alone; Some(Some(v)) sets it back.
        let w = store
            .update(
                &w.id,
                UpdateWorkflowInput {
                    trigger_kind: Some(TriggerKind::Scheduled),
                    schedule_spec: Some(Some("daily:08:00".to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(w.schedule_spec.as_deref(), Some("daily:08:00"));

        let w = store
            .update(
                &w.id,
                UpdateWorkflowInput {
                    name: Some("renamed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(w.schedule_spec.as_deref(), Some("daily:08:00"));
    }

    #[tokio::test]
    async fn test_add_step_rejects_duplicate_output_variable() {
        let db = Database::open_in_memory().unwrap();
        let store = WorkflowStore::new(db);
        let w = store.create(manual_workflow()).await.unwrap();

        store.add_step(&w.id, step("Research", Some("notes"))).await.unwrap();
        let err = store
            .add_step(&w.id, step("Summarize", Some("notes")))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition(_)));

        // Different (or absent) names are fine.
        store
            .add_step(&w.id, step("Summarize", Some("summary")))
            .await
            .unwrap();
        store.add_step(&w.id, step("Notify", None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_step_redensifies_positions() {
        let db = Database::open_in_memory().unwrap();
        let store = WorkflowStore::new(db);
        let w = store.create(manual_workflow()).await.unwrap();

        store.add_step(&w.id, step("A", None)).await.unwrap();
        let b = store.add_step(&w.id, step("B", None)).await.unwrap();
        store.add_step(&w.id, step("C", None)).await.unwrap();

        assert!(store.delete_step(&b.id).await.unwrap());
        let steps = store.steps(&w.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].title, "A");
        assert_eq!(steps[0].position, 0);
        assert_eq!(steps[1].title, "C");
        assert_eq!(steps[1].position, 1);

        assert!(!store.delete_step("missing").await.unwrap());
    }
}
