//! Row-mutation triggers: a broadcast feed of external table events and the
//! listener that turns matching events into runs.
//!
//! Whatever adapter fronts the tabular store (webhook receiver, CDC poller)
//! publishes `TableEvent`s into the feed. Each matching event starts its own
//! run; several mutations in quick succession yield several concurrent runs
//! of the same workflow.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::engine::orchestrator::{Orchestrator, TriggerContext};
use crate::error::EngineError;
use crate::models::workflow::TriggerKind;
use crate::store::WorkflowStore;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TableEventKind {
    RowAdded,
    RowUpdated,
}

impl TableEventKind {
    pub fn trigger_kind(&self) -> TriggerKind {
        match self {
            Self::RowAdded => TriggerKind::RowAdded,
            Self::RowUpdated => TriggerKind::RowUpdated,
        }
    }
}

/// A mutation notification from the external tabular store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableEvent {
    pub table_id: String,
    pub kind: TableEventKind,
    /// The mutated row's field values, seeded as `row.<Field>` variables.
    #[serde(default)]
    pub row: HashMap<String, String>,
}

/// Broadcast channel for table events. Cheap to clone; adapters publish,
/// the listener subscribes.
#[derive(Clone)]
pub struct MutationFeed {
    tx: broadcast::Sender<TableEvent>,
}

impl MutationFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn publish(&self, event: TableEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TableEvent> {
        self.tx.subscribe()
    }
}

impl Default for MutationFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Matches table events against active row-triggered workflows and starts
/// runs for them.
pub struct MutationListener {
    workflow_store: WorkflowStore,
    orchestrator: Arc<Orchestrator>,
}

impl MutationListener {
    pub fn new(workflow_store: WorkflowStore, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            workflow_store,
            orchestrator,
        }
    }

    /// Start a run for every active workflow watching this event's table
    /// and kind. Returns how many runs were started.
    pub async fn handle_event(&self, event: &TableEvent) -> Result<usize, EngineError> {
        let workflows = self
            .workflow_store
            .list_active_by_trigger(event.kind.trigger_kind())
            .await?;

        let mut started = 0;
        for workflow in workflows {
            if workflow.source_table.as_deref() != Some(event.table_id.as_str()) {
                continue;
            }
            tracing::info!(
                "[MutationListener] {:?} on table {} starts workflow \"{}\"",
                event.kind,
                event.table_id,
                workflow.name
            );
            match self
                .orchestrator
                .start_run(&workflow.id, TriggerContext::row(&event.row))
                .await
            {
                Ok(_) => started += 1,
                Err(e) => {
                    tracing::error!(
                        "[MutationListener] Failed to start workflow \"{}\": {}",
                        workflow.name,
                        e
                    );
                }
            }
        }
        Ok(started)
    }

    /// Consume the feed until it closes. Lagged receivers drop events with a
    /// warning rather than stalling the publisher.
    pub fn spawn(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<TableEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let listener = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Err(e) = listener.handle_event(&event).await {
                            tracing::error!("[MutationListener] Failed to handle event: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("[MutationListener] Lagged, dropped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::info!("[MutationListener] Feed closed, loop exiting");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::db::Database;
    use crate::engine::executor::{DispatchRequest, StepExecutor, TaskHandle};
    use crate::events::EventBus;
    use crate::models::run::RunStatus;
    use crate::models::workflow::{CreateStepInput, CreateWorkflowInput, StepConfig, StepGate};
    use crate::store::RunStore;

    struct NullExecutor;

    #[async_trait::async_trait]
    impl StepExecutor for NullExecutor {
        async fn begin(&self, request: &DispatchRequest) -> Result<TaskHandle, String> {
            Ok(TaskHandle {
                task_id: format!("task-{}", request.run_step_id),
            })
        }
    }

    async fn listener_harness() -> (MutationListener, WorkflowStore, RunStore) {
        let db = Database::open_in_memory().unwrap();
        let workflow_store = WorkflowStore::new(db.clone());
        let run_store = RunStore::new(db);
        let orchestrator = Arc::new(Orchestrator::new(
            workflow_store.clone(),
            run_store.clone(),
            Arc::new(NullExecutor),
            EventBus::new(),
        ));
        (
            MutationListener::new(workflow_store.clone(), orchestrator),
            workflow_store,
            run_store,
        )
    }

    async fn row_workflow(store: &WorkflowStore, table: &str, kind: TriggerKind) -> String {
        let w = store
            .create(CreateWorkflowInput {
                name: format!("on {} of {}", kind.as_str(), table),
                description: String::new(),
                trigger_kind: kind,
                schedule_spec: None,
                source_table: Some(table.to_string()),
            })
            .await
            .unwrap();
        store
            .add_step(
                &w.id,
                CreateStepInput {
                    title: "Handle row".to_string(),
                    description: Some("Process {{row.Name}}".to_string()),
                    agent_id: Some("agent-1".to_string()),
                    gate: StepGate::Auto,
                    timeout_minutes: None,
                    config: StepConfig::default(),
                },
            )
            .await
            .unwrap();
        w.id
    }

    fn event(table: &str, kind: TableEventKind, name: &str) -> TableEvent {
        let mut row = HashMap::new();
        row.insert("Name".to_string(), name.to_string());
        TableEvent {
            table_id: table.to_string(),
            kind,
            row,
        }
    }

    #[tokio::test]
    async fn test_event_matches_table_and_kind() {
        let (listener, workflow_store, run_store) = listener_harness().await;
        row_workflow(&workflow_store, "deals", TriggerKind::RowAdded).await;
        row_workflow(&workflow_store, "contacts", TriggerKind::RowAdded).await;
        row_workflow(&workflow_store, "deals", TriggerKind::RowUpdated).await;

        let started = listener
            .handle_event(&event("deals", TableEventKind::RowAdded, "Acme"))
            .await
            .unwrap();
        assert_eq!(started, 1);

        let runs = run_store.list_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].variables.get("row.Name"), Some("Acme"));
    }

    #[tokio::test]
    async fn test_rapid_events_create_independent_runs() {
        let (listener, workflow_store, run_store) = listener_harness().await;
        row_workflow(&workflow_store, "deals", TriggerKind::RowAdded).await;

        listener
            .handle_event(&event("deals", TableEventKind::RowAdded, "Acme"))
            .await
            .unwrap();
        listener
            .handle_event(&event("deals", TableEventKind::RowAdded, "Globex"))
            .await
            .unwrap();

        let runs = run_store.list_runs().await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_ne!(runs[0].id, runs[1].id);
        assert!(runs.iter().all(|r| r.status == RunStatus::Running));
        // Each run carries its own row's seed, not the other's.
        let names: Vec<_> = runs
            .iter()
            .map(|r| r.variables.get("row.Name").unwrap().to_string())
            .collect();
        assert!(names.contains(&"Acme".to_string()));
        assert!(names.contains(&"Globex".to_string()));
    }

    #[tokio::test]
    async fn test_feed_to_listener_loop() {
        let (listener, workflow_store, run_store) = listener_harness().await;
        row_workflow(&workflow_store, "deals", TriggerKind::RowAdded).await;

        let feed = MutationFeed::new();
        let rx = feed.subscribe();
        let listener = Arc::new(listener);
        let handle = listener.spawn(rx);

        feed.publish(event("deals", TableEventKind::RowAdded, "Acme"));
        drop(feed);
        handle.await.unwrap();

        assert_eq!(run_store.list_runs().await.unwrap().len(), 1);
    }
}
