//! Worker sandbox lifecycle management.
//!
//! Decouples the scheduler from the container engine so that different
//! backends (and in-process fakes in tests) can be used interchangeably.

pub mod docker;

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Opaque handle to a tracked worker sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxHandle(pub String);

impl fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A spawned worker: the handle to manage it and the address to dial.
#[derive(Debug, Clone)]
pub struct SpawnedWorker {
    pub handle: SandboxHandle,
    /// Dial address for the RPC client, e.g. `127.0.0.1:50060`.
    pub address: String,
    /// False when the readiness window expired before the port accepted a
    /// connection. The caller may still proceed and lean on the RPC
    /// client's retry budget, or abort; that policy lives in the scheduler.
    pub ready: bool,
}

/// Configuration for sandbox startup and teardown.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container image for worker processes.
    pub image: String,
    /// First host port to try; allocation increments from here.
    pub port_base: u16,
    /// Port the worker process listens on inside the sandbox.
    pub worker_port: u16,
    /// How long to wait for the worker port to accept a TCP connection.
    pub ready_timeout: Duration,
    /// Interval between readiness probes.
    pub ready_poll: Duration,
    /// Fixed pad after the port opens, covering RPC-framework startup.
    pub startup_grace: Duration,
    /// Graceful-stop window before the worker is force-removed.
    pub stop_timeout: Duration,
    /// Name of the env var carrying the provider credential into workers.
    pub credential_env: String,
    /// Credential value passed through to workers, if configured.
    pub credential: Option<String>,
    /// Additional flags appended to the container run command.
    pub extra_flags: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "foreman-worker:latest".to_string(),
            port_base: 50060,
            worker_port: 50060,
            ready_timeout: Duration::from_secs(30),
            ready_poll: Duration::from_secs(1),
            startup_grace: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
            credential_env: "FOREMAN_WORKER_API_KEY".to_string(),
            credential: None,
            extra_flags: Vec::new(),
        }
    }
}

/// Trait for worker sandbox backends.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Human-readable name of the backend (e.g. "docker").
    fn name(&self) -> &str;

    /// Start one fresh isolated worker and wait until it is reachable.
    ///
    /// `label` scopes the sandbox name to its task/expert; `env` carries
    /// per-worker variables (task id, scoped token) beside the configured
    /// provider credential. Engine-contact failures surface immediately;
    /// there is no retry at this layer.
    async fn spawn(
        &self,
        label: &str,
        env: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<SpawnedWorker>;

    /// Gracefully stop and remove a worker, releasing its port.
    async fn stop(&self, handle: &SandboxHandle) -> Result<()>;

    /// Tail of the worker's combined stdout/stderr, for diagnostics after
    /// a failed RPC.
    async fn logs(&self, handle: &SandboxHandle, tail: usize) -> Result<String>;

    /// Best-effort shutdown of every tracked worker, for process exit.
    async fn stop_all(&self);
}

// Compile-time assertion: Sandbox must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Sandbox) {}
};
