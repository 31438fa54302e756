//! Docker sandbox backend.
//!
//! Each worker runs in its own container with the RPC port published on a
//! host port allocated from a monotonic counter. Readiness is a plain TCP
//! dial, not an application-level call; the RPC-framework handshake is
//! covered by the startup grace plus the RPC client's own retry budget.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;

use tokio_util::sync::CancellationToken;

use super::{Sandbox, SandboxConfig, SandboxHandle, SpawnedWorker};

/// A tracked container and the host port reserved for it.
#[derive(Debug, Clone)]
struct TrackedWorker {
    container: String,
    port: u16,
}

/// Mutable allocator state: the port counter and the set of live workers.
#[derive(Debug)]
struct SandboxState {
    next_port: u16,
    active: HashMap<String, TrackedWorker>,
}

/// Sandbox backend that runs each worker in a Docker container.
#[derive(Debug)]
pub struct DockerSandbox {
    config: SandboxConfig,
    state: Mutex<SandboxState>,
}

impl DockerSandbox {
    /// Create a new Docker sandbox manager.
    pub fn new(config: SandboxConfig) -> Self {
        let next_port = config.port_base;
        Self {
            config,
            state: Mutex::new(SandboxState {
                next_port,
                active: HashMap::new(),
            }),
        }
    }

    /// Build the container name for a worker label.
    fn container_name(label: &str, port: u16) -> String {
        // Sanitize for Docker container naming (alphanumeric + hyphens).
        let sanitized: String = label
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        format!("foreman-{sanitized}-{port}")
    }

    /// Reserve the next free host port.
    ///
    /// The counter only moves forward; ports held by live workers or bound
    /// by other processes on the host are skipped by incrementing.
    fn allocate_port(&self) -> Result<u16> {
        let mut state = self.state.lock().expect("sandbox state lock poisoned");
        loop {
            let candidate = state.next_port;
            if candidate == u16::MAX {
                bail!("sandbox port counter exhausted");
            }
            state.next_port += 1;

            if state.active.values().any(|w| w.port == candidate) {
                continue;
            }
            // Probe for external users of the port; a successful bind means
            // the port is free right now.
            match TcpListener::bind(("127.0.0.1", candidate)) {
                Ok(listener) => {
                    drop(listener);
                    return Ok(candidate);
                }
                Err(_) => continue,
            }
        }
    }

    /// Release a handle's port and forget the container.
    fn release(&self, handle: &SandboxHandle) -> Option<TrackedWorker> {
        let mut state = self.state.lock().expect("sandbox state lock poisoned");
        state.active.remove(&handle.0)
    }

    /// Poll the worker port until it accepts a TCP connection or the
    /// readiness window closes. Returns `true` when the dial succeeded.
    async fn wait_ready(&self, port: u16, cancel: &CancellationToken) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.ready_timeout;
        loop {
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                // Give the RPC framework time to finish startup behind the
                // open port.
                tokio::time::sleep(self.config.startup_grace).await;
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.ready_poll) => {}
                _ = cancel.cancelled() => return false,
            }
        }
    }

    async fn docker(args: &[String]) -> Result<std::process::Output> {
        Command::new("docker")
            .args(args)
            .output()
            .await
            .context("failed to run docker")
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn name(&self) -> &str {
        "docker"
    }

    async fn spawn(
        &self,
        label: &str,
        env: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<SpawnedWorker> {
        let port = self.allocate_port()?;
        let container = Self::container_name(label, port);

        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            container.clone(),
            "-p".to_string(),
            format!("{port}:{}", self.config.worker_port),
            "-e".to_string(),
            format!("PORT={}", self.config.worker_port),
        ];
        if let Some(ref credential) = self.config.credential {
            args.push("-e".to_string());
            args.push(format!("{}={credential}", self.config.credential_env));
        }
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for flag in &self.config.extra_flags {
            args.push(flag.clone());
        }
        args.push(self.config.image.clone());

        let output = Self::docker(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("docker run failed for {container}: {stderr}");
        }

        let handle = SandboxHandle(container.clone());
        {
            let mut state = self.state.lock().expect("sandbox state lock poisoned");
            state
                .active
                .insert(container.clone(), TrackedWorker { container: container.clone(), port });
        }

        let ready = self.wait_ready(port, cancel).await;
        if !ready {
            tracing::warn!(
                container = %container,
                port = port,
                "worker port not reachable before readiness deadline"
            );
        }

        Ok(SpawnedWorker {
            handle,
            address: format!("127.0.0.1:{port}"),
            ready,
        })
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<()> {
        let Some(worker) = self.release(handle) else {
            bail!("unknown sandbox handle {handle}");
        };

        let stop_secs = self.config.stop_timeout.as_secs().to_string();
        let output = Self::docker(&[
            "stop".to_string(),
            "-t".to_string(),
            stop_secs,
            worker.container.clone(),
        ])
        .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                container = %worker.container,
                "docker stop failed, forcing removal: {stderr}"
            );
        }

        let output = Self::docker(&[
            "rm".to_string(),
            "-f".to_string(),
            worker.container.clone(),
        ])
        .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // The port is already released; a zombie container is tolerated
            // and swept by stop_all.
            if !stderr.contains("No such container") {
                tracing::warn!(container = %worker.container, "docker rm failed: {stderr}");
            }
        }

        Ok(())
    }

    async fn logs(&self, handle: &SandboxHandle, tail: usize) -> Result<String> {
        let output = Self::docker(&[
            "logs".to_string(),
            "--tail".to_string(),
            tail.to_string(),
            handle.0.clone(),
        ])
        .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("docker logs failed for {handle}: {stderr}");
        }
        // Docker interleaves worker stdout/stderr across the two streams.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    async fn stop_all(&self) {
        let workers: Vec<TrackedWorker> = {
            let mut state = self.state.lock().expect("sandbox state lock poisoned");
            state.active.drain().map(|(_, w)| w).collect()
        };

        for worker in workers {
            let output = Self::docker(&[
                "rm".to_string(),
                "-f".to_string(),
                worker.container.clone(),
            ])
            .await;
            match output {
                Ok(out) if out.status.success() => {}
                Ok(out) => {
                    let stderr = String::from_utf8_lossy(&out.stderr);
                    if !stderr.contains("No such container") {
                        tracing::warn!(
                            container = %worker.container,
                            "failed to remove worker on shutdown: {stderr}"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        container = %worker.container,
                        error = %e,
                        "failed to remove worker on shutdown"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_sanitizes() {
        assert_eq!(
            DockerSandbox::container_name("task 1/poet", 50060),
            "foreman-task-1-poet-50060"
        );
        assert_eq!(
            DockerSandbox::container_name("alpha-beta", 50061),
            "foreman-alpha-beta-50061"
        );
    }

    #[test]
    fn config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.port_base, 50060);
        assert_eq!(config.ready_timeout.as_secs(), 30);
        assert_eq!(config.startup_grace.as_secs(), 5);
        assert_eq!(config.stop_timeout.as_secs(), 10);
    }

    #[test]
    fn port_allocation_is_monotonic() {
        let sandbox = DockerSandbox::new(SandboxConfig {
            port_base: 51200,
            ..SandboxConfig::default()
        });
        let first = sandbox.allocate_port().expect("should allocate");
        let second = sandbox.allocate_port().expect("should allocate");
        assert!(first >= 51200);
        assert!(second > first);
    }

    #[test]
    fn port_allocation_skips_bound_ports() {
        // Bind the base port externally; the allocator must move past it.
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind should succeed");
        let bound = listener.local_addr().unwrap().port();

        let sandbox = DockerSandbox::new(SandboxConfig {
            port_base: bound,
            ..SandboxConfig::default()
        });
        let allocated = sandbox.allocate_port().expect("should allocate");
        assert_ne!(allocated, bound);
        assert!(allocated > bound);
    }

    #[tokio::test]
    async fn stop_rejects_unknown_handle() {
        let sandbox = DockerSandbox::new(SandboxConfig::default());
        let err = sandbox
            .stop(&SandboxHandle("foreman-ghost-50060".to_string()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown sandbox handle"));
    }
}
