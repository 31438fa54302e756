//! Phase execution: expert fan-out, result interpretation, the
//! phase-completion check, and advancement.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;

use foreman_db::models::{ExpertStatus, PhaseStatus, TaskRecord, TaskStatus};

use crate::bus::EventKind;
use crate::rpc::{CallError, WorkerRequest};
use crate::sandbox::SandboxHandle;
use crate::token;

use super::{Advance, Scheduler, TaskSlot};

/// Terminal outcome of one expert execution.
enum ExpertOutcome {
    Completed(String),
    Failed(String),
}

impl Scheduler {
    /// Mark phase `index` running and fan out its experts.
    ///
    /// Runs in a background task: the spawn loop sleeps the configured
    /// stagger between consecutive experts.
    pub(crate) fn start_phase(
        self: Arc<Self>,
        task_id: String,
        index: usize,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let Some(slot) = self.slot(&task_id).await else {
                return;
            };

            let roles = {
                let mut rec = slot.record.lock().await;
                if rec.status.is_terminal() || rec.current_phase != index {
                    return;
                }
                let Some(phase) = rec.phases.get_mut(index) else {
                    tracing::error!(task_id = %task_id, index = index, "phase index out of range");
                    return;
                };
                if phase.status != PhaseStatus::Pending {
                    return;
                }
                phase.status = PhaseStatus::Running;
                phase.started_at = Some(Utc::now());
                let phase_id = phase.id.clone();
                let roles: Vec<String> = phase.experts.iter().map(|e| e.role.clone()).collect();
                rec.status = TaskStatus::Running;

                if let Err(e) = self
                    .commit(&mut rec, &[(EventKind::PhaseStarted, Some(phase_id.clone()))])
                    .await
                {
                    tracing::error!(task_id = %task_id, error = %e, "failed to persist phase start");
                    return;
                }
                tracing::info!(
                    task_id = %task_id,
                    phase_id = %phase_id,
                    experts = roles.len(),
                    "phase started"
                );
                roles
            };

            for (i, role) in roles.into_iter().enumerate() {
                if i > 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.expert_stagger) => {}
                        _ = slot.cancel.cancelled() => return,
                    }
                }
                let this = Arc::clone(&self);
                let task_id = task_id.clone();
                tokio::spawn(async move {
                    this.run_expert(task_id, index, role).await;
                });
            }
        })
    }

    /// Drive one expert from `pending` to a terminal status.
    async fn run_expert(self: Arc<Self>, task_id: String, phase_index: usize, role: String) {
        let Some(slot) = self.slot(&task_id).await else {
            return;
        };

        let (persona, instructions, context) = {
            let mut rec = slot.record.lock().await;
            if rec.status.is_terminal() || rec.current_phase != phase_index {
                return;
            }
            let context = build_context(&rec, phase_index);
            let Some(phase) = rec.phases.get_mut(phase_index) else {
                return;
            };
            let phase_id = phase.id.clone();
            let Some(expert) = phase.expert_mut(&role) else {
                return;
            };
            if expert.status != ExpertStatus::Pending {
                return;
            }
            expert.status = ExpertStatus::Running;
            let persona = expert.persona.clone();
            let instructions = expert.task.clone();

            if let Err(e) = self
                .commit(&mut rec, &[(EventKind::ExpertStarted, Some(phase_id))])
                .await
            {
                tracing::error!(
                    task_id = %task_id,
                    role = %role,
                    error = %e,
                    "failed to persist expert start"
                );
                return;
            }
            (persona, instructions, context)
        };

        let outcome = self
            .call_expert(
                &slot,
                &task_id,
                phase_index,
                &role,
                persona,
                instructions,
                context,
            )
            .await;
        self.finish_expert(&task_id, phase_index, &role, outcome)
            .await;
    }

    /// Spawn a sandbox, dispatch the worker call, interpret the result, and
    /// stop the sandbox on every path.
    #[allow(clippy::too_many_arguments)]
    async fn call_expert(
        &self,
        slot: &TaskSlot,
        task_id: &str,
        phase_index: usize,
        role: &str,
        persona: String,
        instructions: String,
        context: HashMap<String, String>,
    ) -> ExpertOutcome {
        let worker_token = token::generate_token(&self.token_config, task_id, role);
        let env = vec![
            ("FOREMAN_TASK_ID".to_string(), task_id.to_string()),
            ("FOREMAN_EXPERT_ROLE".to_string(), role.to_string()),
            ("FOREMAN_WORKER_TOKEN".to_string(), worker_token),
        ];

        let spawned = match self
            .sandbox
            .spawn(&format!("{task_id}-{role}"), &env, &slot.cancel)
            .await
        {
            Ok(spawned) => spawned,
            Err(e) => return ExpertOutcome::Failed(format!("Sandbox failure: {e:#}")),
        };
        if !spawned.ready {
            tracing::warn!(
                task_id = %task_id,
                role = %role,
                "worker missed its readiness window, relying on call retries"
            );
        }

        // Experts in phase 0 may not delegate, whatever the plan said.
        let can_delegate = phase_index != 0;
        let request = WorkerRequest::new(task_id, persona, instructions, Some(context), can_delegate);
        let result = self.worker.call(&spawned.address, request, &slot.cancel).await;

        if result.is_err() {
            self.log_worker_tail(&spawned.handle, task_id, role).await;
        }
        if let Err(e) = self.sandbox.stop(&spawned.handle).await {
            tracing::warn!(
                task_id = %task_id,
                role = %role,
                error = %e,
                "failed to stop worker sandbox"
            );
        }

        match result {
            Err(CallError::Transport(e)) => ExpertOutcome::Failed(format!("Transport: {e}")),
            Err(CallError::Worker(e)) => ExpertOutcome::Failed(format!("AGENT ERROR: {e}")),
            Err(CallError::Malformed(e)) => {
                ExpertOutcome::Failed(format!("Malformed result: {e}"))
            }
            Ok(result) => {
                if !result.subtasks.is_empty() {
                    if can_delegate {
                        ExpertOutcome::Failed(format!(
                            "UnexpectedDelegation: worker returned {} sub-tasks; delegation is not supported in phased execution",
                            result.subtasks.len()
                        ))
                    } else {
                        ExpertOutcome::Failed(format!(
                            "PolicyViolation: worker returned {} sub-tasks with delegation disabled",
                            result.subtasks.len()
                        ))
                    }
                } else {
                    match result.final_content.filter(|c| !c.trim().is_empty()) {
                        Some(content) => ExpertOutcome::Completed(content),
                        None => ExpertOutcome::Failed(
                            "Malformed result: success with empty content".to_string(),
                        ),
                    }
                }
            }
        }
    }

    /// Record an expert's terminal status, then run the phase-completion
    /// check under the same lock hold.
    async fn finish_expert(
        &self,
        task_id: &str,
        phase_index: usize,
        role: &str,
        outcome: ExpertOutcome,
    ) {
        let Some(slot) = self.slot(task_id).await else {
            return;
        };

        let advance = {
            let mut rec = slot.record.lock().await;
            if rec.status.is_terminal() {
                return;
            }
            let requires_approval = rec.requires_user_approval;
            let Some(phase) = rec.phases.get_mut(phase_index) else {
                return;
            };
            let phase_id = phase.id.clone();
            let mut events: Vec<(EventKind, Option<String>)> = Vec::new();

            match outcome {
                ExpertOutcome::Completed(content) => {
                    let Some(expert) = phase.expert_mut(role) else {
                        return;
                    };
                    if expert.status.is_terminal() {
                        return;
                    }
                    expert.status = ExpertStatus::Completed;
                    expert.result = Some(content.clone());
                    phase.results.insert(role.to_string(), content);
                    events.push((EventKind::ExpertCompleted, Some(phase_id.clone())));
                    tracing::info!(task_id = %task_id, role = %role, "expert completed");
                }
                ExpertOutcome::Failed(error) => {
                    let Some(expert) = phase.expert_mut(role) else {
                        return;
                    };
                    if expert.status.is_terminal() {
                        return;
                    }
                    tracing::warn!(task_id = %task_id, role = %role, "expert failed: {error}");
                    expert.status = ExpertStatus::Failed;
                    expert.error = Some(error);
                    events.push((EventKind::ExpertFailed, Some(phase_id.clone())));
                }
            }

            let mut advance = None;
            if rec.phases[phase_index].all_experts_terminal() {
                // A phase with any failed expert always parks for approval,
                // even in auto-mode: failures never auto-approve silently.
                let needs_gate =
                    requires_approval || rec.phases[phase_index].has_failed_expert();
                let phase = &mut rec.phases[phase_index];
                phase.completed_at = Some(Utc::now());
                events.push((EventKind::PhaseCompleted, Some(phase_id.clone())));

                if needs_gate {
                    phase.status = PhaseStatus::AwaitingApproval;
                    events.push((EventKind::PhaseAwaitingApproval, Some(phase_id.clone())));
                    rec.status = TaskStatus::AwaitingApproval;
                    tracing::info!(
                        task_id = %task_id,
                        phase_id = %phase_id,
                        "phase awaiting approval"
                    );
                } else {
                    phase.approved = true;
                    phase.status = PhaseStatus::Approved;
                    events.push((EventKind::PhaseApproved, Some(phase_id.clone())));
                    advance = Some(Self::advance_locked(&mut rec, &mut events));
                }
            }

            if let Err(e) = self.commit(&mut rec, &events).await {
                tracing::error!(
                    task_id = %task_id,
                    role = %role,
                    error = %e,
                    "failed to persist expert result"
                );
                return;
            }
            advance
        };

        if let Some(Advance::NextPhase(next)) = advance {
            let this = self.arc();
            let task_id = task_id.to_string();
            tokio::spawn(async move {
                this.start_phase(task_id, next).await;
            });
        }
    }

    /// Fetch and log a worker's output tail after a failed call.
    pub(crate) async fn log_worker_tail(&self, handle: &SandboxHandle, task_id: &str, role: &str) {
        match self.sandbox.logs(handle, self.config.log_tail).await {
            Ok(tail) if !tail.trim().is_empty() => {
                tracing::warn!(task_id = %task_id, role = %role, "worker log tail:\n{tail}");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(
                    task_id = %task_id,
                    role = %role,
                    error = %e,
                    "could not fetch worker logs"
                );
            }
        }
    }
}

/// Context map handed to an expert: the objective plus every prior phase's
/// results, keyed `<phase_id>/<role>`.
fn build_context(record: &TaskRecord, phase_index: usize) -> HashMap<String, String> {
    let mut context = HashMap::new();
    context.insert("objective".to_string(), record.objective.clone());
    for phase in record.phases.iter().take(phase_index) {
        for (role, result) in &phase.results {
            context.insert(format!("{}/{role}", phase.id), result.clone());
        }
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;

    use foreman_db::models::TaskRecord;

    #[test]
    fn context_carries_objective_and_prior_results() {
        let mut record = TaskRecord::new("Design auth system.", true);
        record.phases = vec![
            foreman_test_utils::phase("phase_1", "Research", &["researcher"]),
            foreman_test_utils::phase("phase_2", "Design", &["architect"]),
        ];
        record.phases[0]
            .results
            .insert("researcher".to_string(), "findings".to_string());

        let context = build_context(&record, 1);
        assert_eq!(context.get("objective").unwrap(), "Design auth system.");
        assert_eq!(context.get("phase_1/researcher").unwrap(), "findings");

        // Phase 0 experts see no prior results.
        let context = build_context(&record, 0);
        assert_eq!(context.len(), 1);
    }
}
