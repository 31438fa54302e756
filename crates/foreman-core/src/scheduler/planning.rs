//! Planning: spawn a single planner worker, parse the plan it returns,
//! and install the phases on the task.
//!
//! Plan-parse failure is fatal to the task; there is no fallback mode.

use std::sync::Arc;

use foreman_db::models::{Expert, ExpertStatus, Phase, PhaseStatus, TaskStatus};

use crate::bus::EventKind;
use crate::plan::{self, PlanParseError, PlanSpec};
use crate::rpc::{CallError, WorkerRequest};
use crate::token;

use super::Scheduler;

/// Why planning failed; decides the error text recorded on the task.
enum PlanningFailure {
    Sandbox(anyhow::Error),
    Call(CallError),
    Parse(PlanParseError),
    Internal(anyhow::Error),
}

impl PlanningFailure {
    fn task_error(&self) -> String {
        match self {
            Self::Parse(e) => format!("PlanInvalid: {e}"),
            Self::Call(e) => format!("Planning call failed: {e}"),
            Self::Sandbox(e) => format!("Sandbox failure during planning: {e:#}"),
            Self::Internal(e) => format!("Planning failed: {e:#}"),
        }
    }
}

impl Scheduler {
    /// Background planning entry point; failures land on the task record.
    pub(crate) async fn run_planning(self: Arc<Self>, task_id: String) {
        if let Err(failure) = self.plan_task(&task_id).await {
            let error = failure.task_error();
            tracing::error!(task_id = %task_id, "planning failed: {error}");
            if let Err(e) = self.fail_task(&task_id, error).await {
                tracing::error!(
                    task_id = %task_id,
                    error = %e,
                    "failed to record planning failure"
                );
            }
        }
    }

    async fn plan_task(&self, task_id: &str) -> Result<(), PlanningFailure> {
        let slot = self.slot(task_id).await.ok_or_else(|| {
            PlanningFailure::Internal(anyhow::anyhow!("task slot missing for {task_id}"))
        })?;

        let objective = {
            let mut rec = slot.record.lock().await;
            if rec.status != TaskStatus::Pending {
                return Ok(());
            }
            rec.status = TaskStatus::Planning;
            self.commit(&mut rec, &[])
                .await
                .map_err(PlanningFailure::Internal)?;
            rec.objective.clone()
        };

        tracing::info!(task_id = %task_id, "planning task");

        let worker_token = token::generate_token(&self.token_config, task_id, "planner");
        let env = vec![
            ("FOREMAN_TASK_ID".to_string(), task_id.to_string()),
            ("FOREMAN_WORKER_TOKEN".to_string(), worker_token),
        ];
        let spawned = self
            .sandbox
            .spawn(&format!("{task_id}-planner"), &env, &slot.cancel)
            .await
            .map_err(PlanningFailure::Sandbox)?;
        if !spawned.ready {
            tracing::warn!(
                task_id = %task_id,
                "planner sandbox missed its readiness window, relying on call retries"
            );
        }

        let request = WorkerRequest::new(
            task_id,
            plan::prompt::PLANNER_PERSONA,
            plan::prompt::planning_prompt(&objective),
            None,
            false,
        );

        let call = self.worker.call(&spawned.address, request, &slot.cancel);
        let result = match tokio::time::timeout(self.config.planner_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Transport(format!(
                "planner call exceeded its {}s budget",
                self.config.planner_timeout.as_secs()
            ))),
        };

        if result.is_err() {
            self.log_worker_tail(&spawned.handle, task_id, "planner").await;
        }
        if let Err(e) = self.sandbox.stop(&spawned.handle).await {
            tracing::warn!(task_id = %task_id, error = %e, "failed to stop planner sandbox");
        }

        let result = result.map_err(PlanningFailure::Call)?;
        let content = result.final_content.unwrap_or_default();
        let spec = plan::parse_plan(&content).map_err(PlanningFailure::Parse)?;

        let phase_count = spec.phases.len();
        {
            let mut rec = slot.record.lock().await;
            if rec.status.is_terminal() {
                return Ok(());
            }
            rec.phases = phases_from_spec(&spec);
            rec.current_phase = 0;
            rec.status = TaskStatus::Running;
            self.commit(&mut rec, &[(EventKind::PlanGenerated, None)])
                .await
                .map_err(PlanningFailure::Internal)?;
        }
        tracing::info!(task_id = %task_id, phases = phase_count, "plan installed");

        self.arc().start_phase(task_id.to_string(), 0).await;
        Ok(())
    }
}

/// Materialize plan specs into pending phase records.
fn phases_from_spec(spec: &PlanSpec) -> Vec<Phase> {
    spec.phases
        .iter()
        .map(|phase| Phase {
            id: phase.id.clone(),
            name: phase.name.clone(),
            description: phase.description.clone(),
            status: PhaseStatus::Pending,
            experts: phase
                .experts
                .iter()
                .map(|expert| Expert {
                    role: expert.role.clone(),
                    expertise: expert.expertise.clone(),
                    persona: expert.persona.clone(),
                    task: expert.task.clone(),
                    status: ExpertStatus::Pending,
                    result: None,
                    error: None,
                    extra: serde_json::Map::new(),
                })
                .collect(),
            results: std::collections::BTreeMap::new(),
            started_at: None,
            completed_at: None,
            approved: false,
            user_feedback: None,
            extra: serde_json::Map::new(),
        })
        .collect()
}
