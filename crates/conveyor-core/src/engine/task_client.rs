//! HTTP task-service dispatcher — the production `StepExecutor`.
//!
//! The engine treats "assign this step to an agent" as a call to an opaque
//! task-creation service:
//!
//! POST {base_url}/tasks
//! Body: the `DispatchRequest` JSON (agentId, title, instructions, skills,
//! runId/runStepId for correlation).
//! Response: `{ "taskId": "..." }` (also accepts `{ "id": "..." }`).
//!
//! Completion is *not* observed here: the task service is expected to call
//! back (or be polled by an adapter) and push a `TaskSignal` into the
//! engine's signal channel.

use crate::engine::executor::{DispatchRequest, StepExecutor, TaskHandle};

pub struct HttpTaskClient {
    client: reqwest::Client,
    base_url: String,
    /// Fallback agent when a step declares none. Without it, an unassigned
    /// step is a dispatch failure.
    default_agent_id: Option<String>,
}

impl HttpTaskClient {
    pub fn new(base_url: impl Into<String>, default_agent_id: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            base_url: base_url.into(),
            default_agent_id,
        }
    }
}

#[async_trait::async_trait]
impl StepExecutor for HttpTaskClient {
    async fn begin(&self, request: &DispatchRequest) -> Result<TaskHandle, String> {
        let agent_id = request
            .agent_id
            .clone()
            .or_else(|| self.default_agent_id.clone())
            .ok_or_else(|| {
                format!(
                    "No agent assigned to step \"{}\" and no default agent configured",
                    request.title
                )
            })?;

        let url = format!("{}/tasks", self.base_url.trim_end_matches('/'));

        let body = serde_json::json!({
            "agentId": agent_id,
            "title": request.title,
            "instructions": request.instructions,
            "skills": request.skills,
            "runId": request.run_id,
            "runStepId": request.run_step_id,
        });

        tracing::info!(
            "[TaskClient] Creating task for agent {} (step {})",
            agent_id,
            request.run_step_id
        );

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("Task service request failed: {}", e))?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| format!("Failed to read task service response: {}", e))?;

        if !status.is_success() {
            return Err(format!(
                "Task service returned {}: {}",
                status, response_text
            ));
        }

        let json: serde_json::Value = serde_json::from_str(&response_text)
            .map_err(|e| format!("Failed to parse task service response: {}", e))?;

        let task_id = json
            .get("taskId")
            .or_else(|| json.get("id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("Task service response missing taskId: {}", response_text))?;

        Ok(TaskHandle {
            task_id: task_id.to_string(),
        })
    }
}
