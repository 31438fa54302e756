//! Worker RPC dispatch.
//!
//! The scheduler talks to workers through the object-safe
//! [`WorkerTransport`] trait; [`client::HttpWorkerClient`] is the real
//! implementation, tests substitute scripted fakes.

pub mod client;

pub use client::{HttpWorkerClient, RpcConfig};

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by a worker call, split by origin so callers can react
/// differently to each.
#[derive(Debug, Error)]
pub enum CallError {
    /// The worker could not be reached within the attempt budget, or the
    /// transport itself failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The call completed but the worker reported `success = false`.
    #[error("worker reported failure: {0}")]
    Worker(String),

    /// The call completed but the result is structurally invalid.
    #[error("malformed worker result: {0}")]
    Malformed(String),
}

/// Request sent to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task_id: String,
    /// System prompt for the worker's model.
    pub persona: String,
    /// Task instructions.
    pub instructions: String,
    /// Always present on the wire, possibly empty.
    pub context: HashMap<String, String>,
    /// Hard signal: when false, sub-tasks in the result will be rejected.
    pub can_delegate: bool,
}

impl WorkerRequest {
    /// Build a request, normalizing an absent context map to empty.
    pub fn new(
        task_id: impl Into<String>,
        persona: impl Into<String>,
        instructions: impl Into<String>,
        context: Option<HashMap<String, String>>,
        can_delegate: bool,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            persona: persona.into(),
            instructions: instructions.into(),
            context: context.unwrap_or_default(),
            can_delegate,
        }
    }
}

/// Result returned by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    #[serde(default)]
    pub task_id: String,
    pub success: bool,
    /// Present iff the worker executed the task itself.
    #[serde(default)]
    pub final_content: Option<String>,
    /// Present iff `success = false`.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Present iff the worker chose to delegate.
    #[serde(default)]
    pub subtasks: Vec<SubTaskRequest>,
}

/// A sub-task the worker asks to delegate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTaskRequest {
    /// Persona requested for the sub-task's worker.
    pub persona: String,
    /// Task details for the sub-task.
    pub task: String,
}

/// Adapter interface for dispatching a call to one worker.
///
/// Implementations own their retry/timeout discipline; a returned
/// [`CallError::Transport`] means the budget is exhausted.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn call(
        &self,
        address: &str,
        request: WorkerRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkerResult, CallError>;
}

// Compile-time assertion: WorkerTransport must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn WorkerTransport) {}
};
