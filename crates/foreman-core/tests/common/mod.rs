//! Shared fixtures for scheduler integration tests: an in-process sandbox
//! fake, a scripted worker transport, and a harness that wires them to a
//! scratch store.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use foreman_core::bus::{EventBus, EventKind, TaskEvent};
use foreman_core::plan::prompt::PLANNER_PERSONA;
use foreman_core::rpc::{
    CallError, SubTaskRequest, WorkerRequest, WorkerResult, WorkerTransport,
};
use foreman_core::sandbox::{Sandbox, SandboxHandle, SpawnedWorker};
use foreman_core::scheduler::{Scheduler, SchedulerConfig};
use foreman_core::token::TokenConfig;
use foreman_db::models::{TaskRecord, TaskStatus};
use foreman_db::store::TaskStore;
use foreman_test_utils::TestStore;

// ---------------------------------------------------------------------------
// Mock sandbox
// ---------------------------------------------------------------------------

/// In-process sandbox: hands out fake addresses and tracks lifecycle calls.
pub struct MockSandbox {
    next_port: AtomicU16,
    spawn_calls: AtomicUsize,
    /// Spawns succeed while `spawn_calls < fail_after`; later ones fail.
    fail_after: usize,
    pub spawned: Mutex<Vec<String>>,
    pub stopped: Mutex<Vec<String>>,
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::failing_after(usize::MAX)
    }

    /// Sandbox whose spawns fail after the first `n` successes. Use
    /// `failing_after(1)` to let the planner through and fail every expert.
    pub fn failing_after(n: usize) -> Self {
        Self {
            next_port: AtomicU16::new(50060),
            spawn_calls: AtomicUsize::new(0),
            fail_after: n,
            spawned: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn stop_count(&self) -> usize {
        self.stopped.lock().unwrap().len()
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    fn name(&self) -> &str {
        "mock"
    }

    async fn spawn(
        &self,
        label: &str,
        _env: &[(String, String)],
        _cancel: &CancellationToken,
    ) -> Result<SpawnedWorker> {
        if self.spawn_calls.fetch_add(1, Ordering::SeqCst) >= self.fail_after {
            bail!("sandbox engine unreachable");
        }
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        self.spawned.lock().unwrap().push(label.to_string());
        Ok(SpawnedWorker {
            handle: SandboxHandle(format!("mock-{label}-{port}")),
            address: format!("127.0.0.1:{port}"),
            ready: true,
        })
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<()> {
        self.stopped.lock().unwrap().push(handle.0.clone());
        Ok(())
    }

    async fn logs(&self, _handle: &SandboxHandle, _tail: usize) -> Result<String> {
        Ok(String::new())
    }

    async fn stop_all(&self) {}
}

// ---------------------------------------------------------------------------
// Scripted worker transport
// ---------------------------------------------------------------------------

/// Canned reply for one persona.
#[derive(Debug, Clone)]
pub enum Script {
    /// success = true with this final content.
    Content(String),
    /// success = false with this error message.
    WorkerError(String),
    /// Transport failure (retry budget already exhausted).
    Transport(String),
    /// success = true with this many sub-task requests and no content.
    Delegate(usize),
}

/// Worker transport that answers each request by the persona it carries.
pub struct ScriptedWorker {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<WorkerRequest>>,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Script the planner's reply.
    pub fn with_plan(self, plan_json: impl Into<String>) -> Self {
        self.with_persona(PLANNER_PERSONA, Script::Content(plan_json.into()))
    }

    /// Script the reply for an expert role created by [`plan_json`].
    pub fn with_expert(self, role: &str, script: Script) -> Self {
        self.with_persona(&persona_for(role), script)
    }

    pub fn with_persona(self, persona: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(persona.to_string(), script);
        self
    }

    pub fn calls(&self) -> Vec<WorkerRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerTransport for ScriptedWorker {
    async fn call(
        &self,
        _address: &str,
        request: WorkerRequest,
        _cancel: &CancellationToken,
    ) -> Result<WorkerResult, CallError> {
        self.calls.lock().unwrap().push(request.clone());
        let script = self.scripts.lock().unwrap().get(&request.persona).cloned();

        match script {
            None => Err(CallError::Transport(format!(
                "no script for persona starting {:?}",
                request.persona.chars().take(32).collect::<String>()
            ))),
            Some(Script::Content(text)) => Ok(WorkerResult {
                task_id: request.task_id,
                success: true,
                final_content: Some(text),
                error_message: None,
                subtasks: vec![],
            }),
            Some(Script::WorkerError(message)) => Err(CallError::Worker(message)),
            Some(Script::Transport(message)) => Err(CallError::Transport(message)),
            Some(Script::Delegate(count)) => Ok(WorkerResult {
                task_id: request.task_id,
                success: true,
                final_content: None,
                error_message: None,
                subtasks: (0..count)
                    .map(|i| SubTaskRequest {
                        persona: format!("You are sub-worker {i}."),
                        task: format!("Sub-task {i}."),
                    })
                    .collect(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Plan builders
// ---------------------------------------------------------------------------

/// Persona assigned to a role by [`plan_json`] (and by the record builders
/// in foreman-test-utils); used to script replies.
pub fn persona_for(role: &str) -> String {
    format!("You are a {role}.")
}

/// Build planner output: a plan JSON string from (phase id, roles) pairs.
pub fn plan_json(phases: &[(&str, &[&str])]) -> String {
    let phases: Vec<serde_json::Value> = phases
        .iter()
        .map(|(id, roles)| {
            let experts: Vec<serde_json::Value> = roles
                .iter()
                .map(|role| {
                    serde_json::json!({
                        "role": role,
                        "expertise": format!("{role} expertise"),
                        "persona": persona_for(role),
                        "task": format!("Do the {role} work."),
                    })
                })
                .collect();
            serde_json::json!({
                "id": id,
                "name": id,
                "description": format!("{id} phase"),
                "experts": experts,
            })
        })
        .collect();

    serde_json::json!({
        "description": "scripted plan",
        "phases": phases,
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub scheduler: Arc<Scheduler>,
    pub sandbox: Arc<MockSandbox>,
    pub worker: Arc<ScriptedWorker>,
    pub store: TaskStore,
    /// Keeps the temp database directory alive.
    pub ts: TestStore,
}

pub async fn harness(require_approval: bool, worker: ScriptedWorker) -> TestHarness {
    let ts = foreman_test_utils::create_test_store().await;
    harness_on(ts, require_approval, MockSandbox::new(), worker).await
}

pub async fn harness_on(
    ts: TestStore,
    require_approval: bool,
    sandbox: MockSandbox,
    worker: ScriptedWorker,
) -> TestHarness {
    let sandbox = Arc::new(sandbox);
    let worker = Arc::new(worker);
    let config = SchedulerConfig {
        require_approval,
        expert_stagger: Duration::from_millis(10),
        planner_timeout: Duration::from_secs(10),
        log_tail: 20,
    };
    let scheduler = Scheduler::new(
        ts.store.clone(),
        Arc::new(EventBus::default()),
        sandbox.clone(),
        worker.clone(),
        TokenConfig::new(b"test-secret-test-secret".to_vec()),
        config,
    );
    TestHarness {
        scheduler,
        sandbox,
        worker,
        store: ts.store.clone(),
        ts,
    }
}

// ---------------------------------------------------------------------------
// Wait helpers
// ---------------------------------------------------------------------------

/// Poll until the task reaches `status`. Panics on an unexpected terminal
/// status or after ten seconds.
pub async fn wait_for_status(
    scheduler: &Arc<Scheduler>,
    task_id: &str,
    status: TaskStatus,
) -> TaskRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let task = scheduler
            .get_task(task_id)
            .await
            .expect("get_task should succeed")
            .expect("task should exist");
        if task.status == status {
            return task;
        }
        if task.status.is_terminal() {
            panic!(
                "task reached terminal {} while waiting for {} (error: {:?})",
                task.status, status, task.error
            );
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}; current: {}", status, task.status);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Receive events for one task until `last` arrives; returns all of them.
pub async fn collect_until(
    rx: &mut broadcast::Receiver<TaskEvent>,
    task_id: &str,
    last: EventKind,
) -> Vec<TaskEvent> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) => {
                if event.task_id != task_id {
                    continue;
                }
                let kind = event.kind;
                events.push(event);
                if kind == last {
                    return events;
                }
            }
            Ok(Err(e)) => panic!("event bus closed early: {e}"),
            Err(_) => panic!(
                "timed out waiting for {last}; saw {:?}",
                events.iter().map(|e| e.kind).collect::<Vec<_>>()
            ),
        }
    }
}
