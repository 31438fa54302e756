//! The scheduler: exclusive owner of task, phase, and expert state.
//!
//! One cooperating state machine per task drives planning, the phase loop,
//! approval gates, and the terminal transitions. Every mutation happens
//! under the task's slot lock in a fixed order: mutate, persist, publish.
//! The event stream therefore reflects the durable write order.

mod execution;
mod planning;
mod recovery;

pub use recovery::RecoveryReport;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Result, bail};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_util::sync::CancellationToken;

use foreman_db::models::{PhaseStatus, TaskRecord, TaskStatus};
use foreman_db::store::TaskStore;

use crate::bus::{EventBus, EventKind, TaskEvent};
use crate::rpc::WorkerTransport;
use crate::sandbox::Sandbox;
use crate::token::TokenConfig;

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Whether new tasks gate each phase on human approval. When false the
    /// scheduler auto-approves completed phases and advances.
    pub require_approval: bool,
    /// Pause between consecutive expert spawns within a phase.
    pub expert_stagger: Duration,
    /// Wall budget for the planner call.
    pub planner_timeout: Duration,
    /// Log lines tailed from a worker after a failed call.
    pub log_tail: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            require_approval: true,
            expert_stagger: Duration::from_secs(2),
            planner_timeout: Duration::from_secs(300),
            log_tail: 50,
        }
    }
}

/// Errors returned to ingress from approval handling.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("phase {0} not found")]
    PhaseNotFound(String),

    #[error("phase {phase_id} is not awaiting approval (status: {status})")]
    WrongState {
        phase_id: String,
        status: PhaseStatus,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// What to do after a phase was approved (or auto-approved).
pub(crate) enum Advance {
    NextPhase(usize),
    Completed,
}

/// Per-task coordination state. The record lives inside the mutex: holding
/// the lock IS holding the task's single-writer barrier.
pub(crate) struct TaskSlot {
    pub(crate) record: Mutex<TaskRecord>,
    pub(crate) cancel: CancellationToken,
}

/// The scheduler. Shared as `Arc<Scheduler>`; background activities hold
/// clones.
pub struct Scheduler {
    store: TaskStore,
    bus: Arc<EventBus>,
    sandbox: Arc<dyn Sandbox>,
    worker: Arc<dyn WorkerTransport>,
    token_config: TokenConfig,
    config: SchedulerConfig,
    slots: RwLock<HashMap<String, Arc<TaskSlot>>>,
    /// Back-reference so `&self` methods can hand owned clones to the
    /// background activities they spawn.
    self_ref: Weak<Scheduler>,
}

impl Scheduler {
    /// Assemble a scheduler over its collaborators.
    pub fn new(
        store: TaskStore,
        bus: Arc<EventBus>,
        sandbox: Arc<dyn Sandbox>,
        worker: Arc<dyn WorkerTransport>,
        token_config: TokenConfig,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            store,
            bus,
            sandbox,
            worker,
            token_config,
            config,
            slots: RwLock::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// An owned handle to this scheduler, for spawning background work.
    pub(crate) fn arc(&self) -> Arc<Self> {
        self.self_ref
            .upgrade()
            .expect("scheduler dropped while in use")
    }

    /// The event bus, for ingress subscriptions.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The store, for health checks.
    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub(crate) async fn slot(&self, task_id: &str) -> Option<Arc<TaskSlot>> {
        self.slots.read().await.get(task_id).cloned()
    }

    pub(crate) async fn insert_slot(&self, record: TaskRecord) -> Arc<TaskSlot> {
        let id = record.id.clone();
        let slot = Arc::new(TaskSlot {
            record: Mutex::new(record),
            cancel: CancellationToken::new(),
        });
        self.slots.write().await.insert(id, slot.clone());
        slot
    }

    /// Persist the record, then fan out events, in that order. Must be
    /// called while holding the record's slot lock.
    pub(crate) async fn commit(
        &self,
        record: &mut TaskRecord,
        events: &[(EventKind, Option<String>)],
    ) -> Result<()> {
        record.touch();
        self.store.upsert(record).await?;
        for (kind, phase_id) in events {
            let event = match phase_id {
                Some(phase_id) => TaskEvent::with_phase(*kind, record, phase_id.clone()),
                None => TaskEvent::new(*kind, record),
            };
            self.bus.publish(event);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Create a task for an objective and kick off planning in the
    /// background. Returns the persisted `pending` record immediately;
    /// further progress is observed via the bus.
    pub async fn submit(&self, objective: &str) -> Result<TaskRecord> {
        let objective = objective.trim();
        if objective.is_empty() {
            bail!("objective must not be empty");
        }

        let record = TaskRecord::new(objective, self.config.require_approval);
        let task_id = record.id.clone();
        let slot = self.insert_slot(record).await;

        let snapshot = {
            let mut rec = slot.record.lock().await;
            if let Err(e) = self.commit(&mut rec, &[(EventKind::TaskCreated, None)]).await {
                drop(rec);
                self.slots.write().await.remove(&task_id);
                return Err(e);
            }
            rec.clone()
        };
        tracing::info!(task_id = %task_id, "task submitted");

        let this = self.arc();
        tokio::spawn(async move {
            this.run_planning(task_id).await;
        });

        Ok(snapshot)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Snapshot of one task, from the in-memory index with a store
    /// fallback.
    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        if let Some(slot) = self.slot(task_id).await {
            return Ok(Some(slot.record.lock().await.clone()));
        }
        self.store.get(task_id).await
    }

    /// Snapshots of every known task, newest first.
    pub async fn list_tasks(&self) -> Vec<TaskRecord> {
        let slots: Vec<Arc<TaskSlot>> = self.slots.read().await.values().cloned().collect();
        let mut tasks = Vec::with_capacity(slots.len());
        for slot in slots {
            tasks.push(slot.record.lock().await.clone());
        }
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Number of tracked tasks.
    pub async fn task_count(&self) -> usize {
        self.slots.read().await.len()
    }

    /// Subscribe to a task's events. Subscribes before snapshotting so no
    /// event between the two is lost; the caller emits the snapshot first.
    pub async fn subscribe(
        &self,
        task_id: &str,
    ) -> Option<(TaskRecord, broadcast::Receiver<TaskEvent>)> {
        let rx = self.bus.subscribe(task_id);
        let slot = self.slot(task_id).await?;
        let snapshot = slot.record.lock().await.clone();
        Some((snapshot, rx))
    }

    // -----------------------------------------------------------------------
    // Approval and advancement
    // -----------------------------------------------------------------------

    /// Apply a human approval decision to a phase.
    ///
    /// Approving a phase that is already `approved` is an idempotent
    /// success. Anything else outside `awaiting_approval` on the current
    /// phase is rejected with [`ApprovalError::WrongState`].
    pub async fn approve_phase(
        &self,
        task_id: &str,
        phase_id: &str,
        approved: bool,
        feedback: Option<String>,
    ) -> Result<TaskRecord, ApprovalError> {
        let slot = self
            .slot(task_id)
            .await
            .ok_or_else(|| ApprovalError::TaskNotFound(task_id.to_string()))?;

        let (snapshot, advance) = {
            let mut rec = slot.record.lock().await;
            let index = rec
                .phases
                .iter()
                .position(|p| p.id == phase_id)
                .ok_or_else(|| ApprovalError::PhaseNotFound(phase_id.to_string()))?;

            // Idempotent duplicate approval.
            if approved && rec.phases[index].status == PhaseStatus::Approved {
                return Ok(rec.clone());
            }

            if index != rec.current_phase
                || rec.phases[index].status != PhaseStatus::AwaitingApproval
            {
                return Err(ApprovalError::WrongState {
                    phase_id: phase_id.to_string(),
                    status: rec.phases[index].status,
                });
            }

            let mut events: Vec<(EventKind, Option<String>)> = Vec::new();
            let mut advance = None;

            if approved {
                let phase = &mut rec.phases[index];
                phase.approved = true;
                phase.status = PhaseStatus::Approved;
                phase.user_feedback = feedback;
                events.push((EventKind::PhaseApproved, Some(phase_id.to_string())));
                advance = Some(Self::advance_locked(&mut rec, &mut events));
                tracing::info!(task_id = %task_id, phase_id = %phase_id, "phase approved");
            } else {
                let reason = feedback.clone().unwrap_or_default();
                let phase = &mut rec.phases[index];
                phase.status = PhaseStatus::Rejected;
                phase.user_feedback = feedback;
                rec.status = TaskStatus::Failed;
                rec.error = Some(format!("Phase rejected: {reason}"));
                events.push((EventKind::PhaseRejected, Some(phase_id.to_string())));
                events.push((EventKind::TaskStatusUpdated, None));
                tracing::warn!(task_id = %task_id, phase_id = %phase_id, "phase rejected");
            }

            self.commit(&mut rec, &events)
                .await
                .map_err(ApprovalError::Internal)?;
            (rec.clone(), advance)
        };

        if let Some(Advance::NextPhase(next)) = advance {
            let this = self.arc();
            let task_id = task_id.to_string();
            tokio::spawn(async move {
                this.start_phase(task_id, next).await;
            });
        }

        Ok(snapshot)
    }

    /// Move to the next phase, or complete the task when the approved
    /// phase was the last one. Caller holds the slot lock.
    pub(crate) fn advance_locked(
        record: &mut TaskRecord,
        events: &mut Vec<(EventKind, Option<String>)>,
    ) -> Advance {
        if record.current_phase + 1 < record.phases.len() {
            record.current_phase += 1;
            record.status = TaskStatus::Running;
            Advance::NextPhase(record.current_phase)
        } else {
            record.status = TaskStatus::Completed;
            record.final_result = Some(compose_final_result(record));
            events.push((EventKind::TaskCompleted, None));
            Advance::Completed
        }
    }

    // -----------------------------------------------------------------------
    // Failure and teardown
    // -----------------------------------------------------------------------

    /// Transition a task to `failed` with the given error text. No-op on
    /// already-terminal tasks.
    pub(crate) async fn fail_task(&self, task_id: &str, error: String) -> Result<()> {
        let Some(slot) = self.slot(task_id).await else {
            return Ok(());
        };
        let mut rec = slot.record.lock().await;
        if rec.status.is_terminal() {
            return Ok(());
        }
        rec.status = TaskStatus::Failed;
        rec.error = Some(error);
        self.commit(&mut rec, &[(EventKind::TaskStatusUpdated, None)])
            .await
    }

    /// Cancel a task's in-flight work (planner call, expert calls, sandbox
    /// waits). Returns false for unknown tasks.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        match self.slot(task_id).await {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything and reclaim all sandboxes. Called on shutdown.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<TaskSlot>> = self.slots.read().await.values().cloned().collect();
        for slot in slots {
            slot.cancel.cancel();
        }
        self.sandbox.stop_all().await;
    }
}

/// Compose the task's final result from the last phase's expert results.
fn compose_final_result(record: &TaskRecord) -> String {
    let Some(last) = record.phases.last() else {
        return String::new();
    };
    last.results
        .iter()
        .map(|(role, text)| format!("## {role}\n\n{text}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    #[test]
    fn final_result_joins_last_phase_results() {
        let mut record = TaskRecord::new("obj", false);
        record.phases = vec![
            foreman_db::models::Phase {
                id: "phase_1".into(),
                name: "One".into(),
                description: "d".into(),
                status: PhaseStatus::Approved,
                experts: vec![],
                results: BTreeMap::from([("early".to_string(), "ignored".to_string())]),
                started_at: None,
                completed_at: None,
                approved: true,
                user_feedback: None,
                extra: serde_json::Map::new(),
            },
            foreman_db::models::Phase {
                id: "phase_2".into(),
                name: "Two".into(),
                description: "d".into(),
                status: PhaseStatus::Approved,
                experts: vec![],
                results: BTreeMap::from([
                    ("architect".to_string(), "the design".to_string()),
                    ("reviewer".to_string(), "the review".to_string()),
                ]),
                started_at: None,
                completed_at: None,
                approved: true,
                user_feedback: None,
                extra: serde_json::Map::new(),
            },
        ];

        let result = compose_final_result(&record);
        assert!(result.contains("## architect"));
        assert!(result.contains("the review"));
        assert!(!result.contains("ignored"));
    }

    #[test]
    fn advance_moves_to_next_phase_when_one_exists() {
        let mut record = TaskRecord::new("obj", false);
        record.phases = vec![
            foreman_test_phase("phase_1"),
            foreman_test_phase("phase_2"),
        ];
        record.current_phase = 0;

        let mut events = Vec::new();
        match Scheduler::advance_locked(&mut record, &mut events) {
            Advance::NextPhase(1) => {}
            _ => panic!("expected NextPhase(1)"),
        }
        assert_eq!(record.current_phase, 1);
        assert_eq!(record.status, TaskStatus::Running);
        assert!(events.is_empty());
    }

    #[test]
    fn advance_completes_on_last_phase() {
        let mut record = TaskRecord::new("obj", false);
        record.phases = vec![foreman_test_phase("phase_1")];
        record.current_phase = 0;

        let mut events = Vec::new();
        match Scheduler::advance_locked(&mut record, &mut events) {
            Advance::Completed => {}
            _ => panic!("expected Completed"),
        }
        assert_eq!(record.status, TaskStatus::Completed);
        assert!(record.final_result.is_some());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, EventKind::TaskCompleted);
    }

    fn foreman_test_phase(id: &str) -> foreman_db::models::Phase {
        foreman_db::models::Phase {
            id: id.into(),
            name: id.into(),
            description: "d".into(),
            status: PhaseStatus::Pending,
            experts: vec![],
            results: BTreeMap::new(),
            started_at: None,
            completed_at: None,
            approved: false,
            user_feedback: None,
            extra: serde_json::Map::new(),
        }
    }
}
