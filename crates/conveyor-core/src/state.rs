//! Engine wiring and the externally-callable surface.
//!
//! `EngineInner` assembles the database, stores, event bus, orchestrator and
//! trigger listeners, and exposes the operations collaborators call:
//! definition CRUD for the authoring layer, run start/read/approve/cancel
//! for UIs, a task-signal sender for the task-system adapter, and the
//! mutation feed for the tabular-store adapter.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::db::Database;
use crate::engine::executor::{StepExecutor, TaskSignal};
use crate::engine::orchestrator::{Orchestrator, TriggerContext};
use crate::error::EngineError;
use crate::events::{EventBus, RunEvent};
use crate::models::run::RunWithSteps;
use crate::models::workflow::{
    CreateStepInput, CreateWorkflowInput, StepDefinition, UpdateWorkflowInput, Workflow,
    WorkflowStatus,
};
use crate::store::{RunStore, WorkflowStore};
use crate::triggers::{MutationFeed, MutationListener, Scheduler, TableEvent};

/// Shared engine state. Cheap to share behind an `Arc`.
pub struct EngineInner {
    pub db: Database,
    pub workflow_store: WorkflowStore,
    pub run_store: RunStore,
    pub event_bus: EventBus,
    orchestrator: Arc<Orchestrator>,
    scheduler: Arc<Scheduler>,
    mutation_feed: MutationFeed,
    mutation_listener: Arc<MutationListener>,
    task_signals: mpsc::Sender<TaskSignal>,
    // Taken once by `start`.
    signal_rx: Mutex<Option<mpsc::Receiver<TaskSignal>>>,
}

pub type Engine = Arc<EngineInner>;

impl EngineInner {
    pub fn new(db: Database, executor: Arc<dyn StepExecutor>) -> Self {
        let workflow_store = WorkflowStore::new(db.clone());
        let run_store = RunStore::new(db.clone());
        let event_bus = EventBus::new();
        let orchestrator = Arc::new(Orchestrator::new(
            workflow_store.clone(),
            run_store.clone(),
            executor,
            event_bus.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            workflow_store.clone(),
            Arc::clone(&orchestrator),
        ));
        let mutation_feed = MutationFeed::new();
        let mutation_listener = Arc::new(MutationListener::new(
            workflow_store.clone(),
            Arc::clone(&orchestrator),
        ));
        let (task_signals, signal_rx) = mpsc::channel(256);
        Self {
            workflow_store,
            run_store,
            event_bus,
            orchestrator,
            scheduler,
            mutation_feed,
            mutation_listener,
            task_signals,
            signal_rx: Mutex::new(Some(signal_rx)),
            db,
        }
    }

    /// Spawn the background producers: the task-signal loop, the timeout
    /// sweeper, the schedule ticker, and the mutation listener. Each task is
    /// independent and restartable; a fault in one never corrupts run state.
    pub fn start(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        let rx = self.signal_rx.lock().ok().and_then(|mut slot| slot.take());
        match rx {
            Some(rx) => handles.push(self.orchestrator.spawn_signal_loop(rx)),
            None => tracing::warn!("[Engine] Signal loop already started"),
        }
        handles.push(
            self.orchestrator
                .spawn_timeout_sweeper(std::time::Duration::from_secs(30)),
        );
        handles.push(self.scheduler.spawn());
        handles.push(self.mutation_listener.spawn(self.mutation_feed.subscribe()));
        handles
    }

    // ── Definition CRUD ──────────────────────────────────────────────────

    pub async fn create_workflow(
        &self,
        input: CreateWorkflowInput,
    ) -> Result<Workflow, EngineError> {
        self.workflow_store.create(input).await
    }

    pub async fn update_workflow(
        &self,
        id: &str,
        input: UpdateWorkflowInput,
    ) -> Result<Workflow, EngineError> {
        self.workflow_store
            .update(id, input)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Workflow {} not found", id)))
    }

    pub async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<Workflow>, EngineError> {
        self.workflow_store.list(status).await
    }

    pub async fn add_step(
        &self,
        workflow_id: &str,
        input: CreateStepInput,
    ) -> Result<StepDefinition, EngineError> {
        self.workflow_store.add_step(workflow_id, input).await
    }

    pub async fn delete_step(&self, step_id: &str) -> Result<(), EngineError> {
        if !self.workflow_store.delete_step(step_id).await? {
            return Err(EngineError::NotFound(format!("Step {} not found", step_id)));
        }
        Ok(())
    }

    // ── Runs ─────────────────────────────────────────────────────────────

    /// Manual trigger entry point.
    pub async fn start_workflow_run(&self, workflow_id: &str) -> Result<RunWithSteps, EngineError> {
        self.orchestrator
            .start_run(workflow_id, TriggerContext::manual())
            .await
    }

    pub async fn get_workflow_run(&self, run_id: &str) -> Result<RunWithSteps, EngineError> {
        self.run_store
            .get_run_with_steps(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Run {} not found", run_id)))
    }

    pub async fn list_workflow_runs(
        &self,
    ) -> Result<Vec<crate::models::run::WorkflowRun>, EngineError> {
        self.run_store.list_runs().await
    }

    /// The only externally-callable approval signal. Rejected unless the
    /// step is currently awaiting approval.
    pub async fn approve_workflow_run_step(&self, run_step_id: &str) -> Result<(), EngineError> {
        self.orchestrator.approve_step(run_step_id).await
    }

    pub async fn cancel_workflow_run(&self, run_id: &str) -> Result<(), EngineError> {
        self.orchestrator.cancel_run(run_id).await
    }

    // ── Adapter surfaces ─────────────────────────────────────────────────

    /// Sender the task-system adapter pushes completion signals into.
    pub fn task_signal_sender(&self) -> mpsc::Sender<TaskSignal> {
        self.task_signals.clone()
    }

    /// Publish a mutation event from the tabular-store adapter.
    pub fn publish_table_event(&self, event: TableEvent) {
        self.mutation_feed.publish(event);
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.event_bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::engine::executor::{DispatchRequest, TaskHandle, TaskOutcome};
    use crate::models::run::{RunStatus, RunStepStatus};
    use crate::models::workflow::{StepConfig, StepGate, TriggerKind};
    use crate::triggers::TableEventKind;

    struct NullExecutor;

    #[async_trait::async_trait]
    impl crate::engine::executor::StepExecutor for NullExecutor {
        async fn begin(&self, request: &DispatchRequest) -> Result<TaskHandle, String> {
            Ok(TaskHandle {
                task_id: format!("task-{}", request.run_step_id),
            })
        }
    }

    fn engine() -> Engine {
        let db = Database::open_in_memory().unwrap();
        Arc::new(EngineInner::new(db, Arc::new(NullExecutor)))
    }

    async fn wait_for_status(engine: &Engine, run_id: &str, status: RunStatus) -> RunWithSteps {
        for _ in 0..100 {
            let run = engine.get_workflow_run(run_id).await.unwrap();
            if run.run.status == status {
                return run;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("run {} never reached {:?}", run_id, status);
    }

    #[tokio::test]
    async fn test_end_to_end_manual_run() {
        let engine = engine();
        engine.start();

        let w = engine
            .create_workflow(CreateWorkflowInput {
                name: "intake".to_string(),
                description: String::new(),
                trigger_kind: TriggerKind::Manual,
                schedule_spec: None,
                source_table: None,
            })
            .await
            .unwrap();
        engine
            .add_step(
                &w.id,
                CreateStepInput {
                    title: "Only step".to_string(),
                    description: None,
                    agent_id: Some("agent-1".to_string()),
                    gate: StepGate::Auto,
                    timeout_minutes: None,
                    config: StepConfig::default(),
                },
            )
            .await
            .unwrap();

        let run = engine.start_workflow_run(&w.id).await.unwrap();
        assert_eq!(run.steps[0].status, RunStepStatus::Running);

        engine
            .task_signal_sender()
            .send(TaskSignal {
                task_id: run.steps[0].task_id.clone().unwrap_or_else(|| {
                    format!("task-{}", run.steps[0].id)
                }),
                outcome: TaskOutcome::Succeeded {
                    output: "done".to_string(),
                },
            })
            .await
            .unwrap();

        let finished = wait_for_status(&engine, &run.run.id, RunStatus::Completed).await;
        assert_eq!(finished.steps[0].status, RunStepStatus::Completed);
        assert_eq!(finished.steps[0].output.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_row_event_through_feed_starts_run() {
        let engine = engine();
        engine.start();

        let w = engine
            .create_workflow(CreateWorkflowInput {
                name: "on new deal".to_string(),
                description: String::new(),
                trigger_kind: TriggerKind::RowAdded,
                schedule_spec: None,
                source_table: Some("deals".to_string()),
            })
            .await
            .unwrap();
        engine
            .add_step(
                &w.id,
                CreateStepInput {
                    title: "Greet".to_string(),
                    description: Some("Welcome {{row.Name}}".to_string()),
                    agent_id: Some("agent-1".to_string()),
                    gate: StepGate::Auto,
                    timeout_minutes: None,
                    config: StepConfig::default(),
                },
            )
            .await
            .unwrap();

        let mut row = HashMap::new();
        row.insert("Name".to_string(), "Acme".to_string());
        engine.publish_table_event(TableEvent {
            table_id: "deals".to_string(),
            kind: TableEventKind::RowAdded,
            row,
        });

        for _ in 0..100 {
            if !engine.list_workflow_runs().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let runs = engine.list_workflow_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].variables.get("row.Name"), Some("Acme"));
    }

    #[tokio::test]
    async fn test_read_paths_and_rejections() {
        let engine = engine();

        assert!(matches!(
            engine.get_workflow_run("missing").await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.approve_workflow_run_step("missing").await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.cancel_workflow_run("missing").await,
            Err(EngineError::NotFound(_))
        ));
        assert!(matches!(
            engine.delete_step("missing").await,
            Err(EngineError::NotFound(_))
        ));
    }
}
