//! Cold-start recovery: rebuild the in-memory index from the store and
//! resolve executions orphaned by a crash.
//!
//! The policy is deterministic: terminal and gated tasks load untouched,
//! tasks caught before a plan was installed fail outright, and running
//! tasks have their in-flight experts failed so the phase surfaces for
//! approval with the failures visible. A partially completed phase is
//! never silently rerun.

use anyhow::Result;
use chrono::Utc;

use foreman_db::models::{ExpertStatus, PhaseStatus, TaskStatus};

use crate::bus::EventKind;

use super::{Advance, Scheduler};

/// Counts of what recovery touched, for the startup log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    /// Records loaded into the in-memory index.
    pub restored: usize,
    /// Tasks failed because the process died before or during planning.
    pub failed_planning: usize,
    /// Running tasks whose orphaned experts were failed.
    pub recovered_running: usize,
}

impl Scheduler {
    /// Scan the store and rebuild scheduler state. Must run before ingress
    /// starts serving.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let records = self.store.scan().await?;
        let mut report = RecoveryReport::default();
        let mut to_start: Vec<(String, usize)> = Vec::new();

        for mut rec in records {
            report.restored += 1;
            match rec.status {
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::AwaitingApproval => {
                    self.insert_slot(rec).await;
                }
                TaskStatus::Pending | TaskStatus::Planning => {
                    report.failed_planning += 1;
                    rec.status = TaskStatus::Failed;
                    rec.error = Some(
                        "CrashDuringPlanning: process exited before a plan was installed"
                            .to_string(),
                    );
                    let task_id = rec.id.clone();
                    let slot = self.insert_slot(rec).await;
                    let mut locked = slot.record.lock().await;
                    self.commit(&mut locked, &[(EventKind::TaskStatusUpdated, None)])
                        .await?;
                    tracing::warn!(task_id = %task_id, "failed task that crashed during planning");
                }
                TaskStatus::Running => {
                    report.recovered_running += 1;
                    let task_id = rec.id.clone();
                    let requires_approval = rec.requires_user_approval;
                    let phase_index = rec.current_phase;
                    let mut events: Vec<(EventKind, Option<String>)> = Vec::new();
                    let mut advance = None;

                    if rec.phases.get(phase_index).is_none() {
                        rec.status = TaskStatus::Failed;
                        rec.error = Some(
                            "CrashDuringExecution: running task has no current phase".to_string(),
                        );
                        events.push((EventKind::TaskStatusUpdated, None));
                    } else {
                        let phase = &mut rec.phases[phase_index];
                        let phase_id = phase.id.clone();

                        let mut orphaned = 0usize;
                        for expert in &mut phase.experts {
                            if !expert.status.is_terminal() {
                                orphaned += 1;
                                expert.status = ExpertStatus::Failed;
                                expert.error = Some(
                                    "CrashDuringExecution: process exited while the expert was in flight"
                                        .to_string(),
                                );
                                events.push((EventKind::ExpertFailed, Some(phase_id.clone())));
                            }
                        }
                        tracing::warn!(
                            task_id = %task_id,
                            phase_id = %phase_id,
                            orphaned = orphaned,
                            "failed orphaned experts of a running task"
                        );

                        // Every expert is terminal now; run the usual
                        // phase-completion check. A phase with failures
                        // always parks for approval, even in auto-mode.
                        let needs_gate = requires_approval
                            || orphaned > 0
                            || rec.phases[phase_index].has_failed_expert();
                        let phase = &mut rec.phases[phase_index];
                        phase.completed_at = Some(Utc::now());
                        events.push((EventKind::PhaseCompleted, Some(phase_id.clone())));
                        if needs_gate {
                            phase.status = PhaseStatus::AwaitingApproval;
                            events
                                .push((EventKind::PhaseAwaitingApproval, Some(phase_id.clone())));
                            rec.status = TaskStatus::AwaitingApproval;
                        } else {
                            phase.approved = true;
                            phase.status = PhaseStatus::Approved;
                            events.push((EventKind::PhaseApproved, Some(phase_id)));
                            advance = Some(Self::advance_locked(&mut rec, &mut events));
                        }
                    }

                    let slot = self.insert_slot(rec).await;
                    {
                        let mut locked = slot.record.lock().await;
                        self.commit(&mut locked, &events).await?;
                    }
                    if let Some(Advance::NextPhase(next)) = advance {
                        to_start.push((task_id, next));
                    }
                }
            }
        }

        // Auto-mode tasks whose recovered phase auto-approved move on to
        // the next phase as normal scheduling work.
        for (task_id, index) in to_start {
            let this = self.arc();
            tokio::spawn(async move {
                this.start_phase(task_id, index).await;
            });
        }

        tracing::info!(
            restored = report.restored,
            failed_planning = report.failed_planning,
            recovered_running = report.recovered_running,
            "recovery complete"
        );
        Ok(report)
    }
}
