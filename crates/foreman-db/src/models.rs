use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Terminal statuses are sticky: no further transitions are allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "running" => Ok(Self::Running),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a phase within a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    AwaitingApproval,
    Approved,
    Rejected,
    Completed,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

impl FromStr for PhaseStatus {
    type Err = PhaseStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "completed" => Ok(Self::Completed),
            other => Err(PhaseStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PhaseStatus`] string.
#[derive(Debug, Clone)]
pub struct PhaseStatusParseError(pub String);

impl fmt::Display for PhaseStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid phase status: {:?}", self.0)
    }
}

impl std::error::Error for PhaseStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of an expert within a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExpertStatus {
    /// An expert is terminal once it has completed or failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExpertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for ExpertStatus {
    type Err = ExpertStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ExpertStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExpertStatus`] string.
#[derive(Debug, Clone)]
pub struct ExpertStatusParseError(pub String);

impl fmt::Display for ExpertStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid expert status: {:?}", self.0)
    }
}

impl std::error::Error for ExpertStatusParseError {}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A task -- a user objective and all state tracking its execution.
///
/// This is the single owning record: phases and experts are embedded, and
/// the whole record is persisted atomically. The `extra` map captures any
/// fields written by a newer version of the software so they survive a
/// read-modify-write cycle untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub objective: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub phases: Vec<Phase>,
    /// Index of the phase currently executing or awaiting approval.
    #[serde(default)]
    pub current_phase: usize,
    pub requires_user_approval: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskRecord {
    /// Create a fresh `pending` task for an objective.
    pub fn new(objective: impl Into<String>, requires_user_approval: bool) -> Self {
        let now = Utc::now();
        Self {
            id: generate_task_id(),
            objective: objective.into(),
            status: TaskStatus::Pending,
            phases: Vec::new(),
            current_phase: 0,
            requires_user_approval,
            created_at: now,
            updated_at: now,
            final_result: None,
            error: None,
            extra: serde_json::Map::new(),
        }
    }

    /// The phase at `current_phase`, if the plan has been installed.
    pub fn current_phase(&self) -> Option<&Phase> {
        self.phases.get(self.current_phase)
    }

    /// Mutable access to the phase at `current_phase`.
    pub fn current_phase_mut(&mut self) -> Option<&mut Phase> {
        self.phases.get_mut(self.current_phase)
    }

    /// Look up a phase by its planner-assigned id.
    pub fn phase_by_id(&self, phase_id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    /// Mutable lookup of a phase by id.
    pub fn phase_by_id_mut(&mut self, phase_id: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.id == phase_id)
    }

    /// Stamp `updated_at`. Called on every durable write.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Generate a task id: timestamp-prefixed so ids sort roughly by creation
/// time, with a random suffix to break ties.
pub fn generate_task_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("task_{}_{}", Utc::now().timestamp_millis(), &suffix[..8])
}

/// An ordered stage of a task, containing experts that run in parallel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    /// Stable id assigned by the planner (e.g. `phase_1_planning`).
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: PhaseStatus,
    #[serde(default)]
    pub experts: Vec<Expert>,
    /// Expert role -> result text, populated as experts finish.
    #[serde(default)]
    pub results: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_feedback: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Phase {
    /// True once every expert has completed or failed.
    pub fn all_experts_terminal(&self) -> bool {
        self.experts.iter().all(|e| e.status.is_terminal())
    }

    /// True if any expert ended in `failed`.
    pub fn has_failed_expert(&self) -> bool {
        self.experts
            .iter()
            .any(|e| e.status == ExpertStatus::Failed)
    }

    /// Mutable lookup of an expert by role.
    pub fn expert_mut(&mut self, role: &str) -> Option<&mut Expert> {
        self.experts.iter_mut().find(|e| e.role == role)
    }
}

/// A leaf unit of work executed by one sandboxed worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expert {
    /// Role string, unique within its phase.
    pub role: String,
    pub expertise: String,
    /// System prompt handed to the worker.
    pub persona: String,
    /// Task instructions handed to the worker.
    pub task: String,
    pub status: ExpertStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
