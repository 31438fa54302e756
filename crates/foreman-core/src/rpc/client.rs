//! HTTP/JSON worker client with bounded retries.
//!
//! Each attempt opens a fresh connection with its own connect and call
//! budgets. Only transport failures are retried; worker-reported and
//! malformed results are final on the first attempt.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{CallError, WorkerRequest, WorkerResult, WorkerTransport};

/// Timeouts and retry budget for worker calls.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// TCP connect budget per attempt, covering the framework handshake.
    pub connect_timeout: Duration,
    /// Whole-call budget per attempt.
    pub call_timeout: Duration,
    /// Outer retry budget.
    pub attempts: u32,
    /// Linear backoff unit: attempt N sleeps `N * backoff` before retrying.
    pub backoff: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(120),
            attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Worker client speaking JSON over HTTP (`POST http://<address>/task`).
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    config: RpcConfig,
}

impl HttpWorkerClient {
    /// Create a client with the given budgets.
    pub fn new(config: RpcConfig) -> Self {
        Self { config }
    }

    fn endpoint(address: &str) -> String {
        if address.starts_with("http://") || address.starts_with("https://") {
            format!("{}/task", address.trim_end_matches('/'))
        } else {
            format!("http://{address}/task")
        }
    }

    /// One attempt over a fresh connection.
    async fn attempt(&self, url: &str, request: &WorkerRequest) -> Result<WorkerResult, CallError> {
        // A fresh client per attempt so no pooled connection from a failed
        // attempt is reused.
        let client = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.call_timeout)
            .build()
            .map_err(|e| CallError::Transport(format!("failed to build HTTP client: {e}")))?;

        let response = client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| CallError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallError::Transport(format!(
                "worker returned HTTP {status}"
            )));
        }

        let result: WorkerResult = response
            .json()
            .await
            .map_err(|e| CallError::Malformed(format!("undecodable response body: {e}")))?;

        validate_result(result)
    }
}

/// Structural validation of a decoded worker result.
///
/// Delegation policy is judged by the scheduler, which knows what
/// `can_delegate` it sent; this layer only rejects results that are
/// invalid in any context.
fn validate_result(result: WorkerResult) -> Result<WorkerResult, CallError> {
    if !result.success {
        let detail = result
            .error_message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| "worker reported failure without detail".to_string());
        return Err(CallError::Worker(detail));
    }

    let has_content = result
        .final_content
        .as_deref()
        .is_some_and(|c| !c.trim().is_empty());
    if !has_content && result.subtasks.is_empty() {
        return Err(CallError::Malformed(
            "success with neither content nor sub-tasks".to_string(),
        ));
    }

    Ok(result)
}

#[async_trait]
impl WorkerTransport for HttpWorkerClient {
    async fn call(
        &self,
        address: &str,
        request: WorkerRequest,
        cancel: &CancellationToken,
    ) -> Result<WorkerResult, CallError> {
        let url = Self::endpoint(address);

        let mut last_transport_error = String::new();
        for attempt in 1..=self.config.attempts {
            if cancel.is_cancelled() {
                return Err(CallError::Transport("call cancelled".to_string()));
            }

            let outcome = tokio::select! {
                outcome = self.attempt(&url, &request) => outcome,
                _ = cancel.cancelled() => {
                    return Err(CallError::Transport("call cancelled".to_string()));
                }
            };

            match outcome {
                Ok(result) => return Ok(result),
                Err(CallError::Transport(e)) => {
                    tracing::warn!(
                        address = %address,
                        task_id = %request.task_id,
                        attempt = attempt,
                        attempts = self.config.attempts,
                        "worker call attempt failed: {e}"
                    );
                    last_transport_error = e;
                    if attempt < self.config.attempts {
                        let backoff = self.config.backoff * attempt;
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = cancel.cancelled() => {
                                return Err(CallError::Transport("call cancelled".to_string()));
                            }
                        }
                    }
                }
                // Worker-reported and malformed results are final.
                Err(other) => return Err(other),
            }
        }

        Err(CallError::Transport(format!(
            "all {} attempts failed; last error: {last_transport_error}",
            self.config.attempts
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> RpcConfig {
        RpcConfig {
            connect_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(2),
            attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }

    fn request() -> WorkerRequest {
        WorkerRequest::new("task_1_a", "You are a poet.", "Write a haiku.", None, false)
    }

    #[tokio::test]
    async fn successful_call_returns_content() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/task")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"task_id": "task_1_a", "success": true, "final_content": "An old pond."}"#)
            .expect(1)
            .create_async()
            .await;

        let client = HttpWorkerClient::new(fast_config());
        let result = client
            .call(&server.host_with_port(), request(), &CancellationToken::new())
            .await
            .expect("call should succeed");

        assert_eq!(result.final_content.as_deref(), Some("An old pond."));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn worker_reported_failure_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/task")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success": false, "error_message": "LLM timeout"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = HttpWorkerClient::new(fast_config());
        let err = client
            .call(&server.host_with_port(), request(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            CallError::Worker(detail) => assert_eq!(detail, "LLM timeout"),
            other => panic!("expected Worker error, got: {other}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn transport_errors_exhaust_the_retry_budget() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/task")
            .with_status(502)
            .expect(3)
            .create_async()
            .await;

        let client = HttpWorkerClient::new(fast_config());
        let err = client
            .call(&server.host_with_port(), request(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            CallError::Transport(detail) => {
                assert!(detail.contains("all 3 attempts failed"), "got: {detail}");
            }
            other => panic!("expected Transport error, got: {other}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn empty_success_is_malformed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/task")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"success": true}"#)
            .expect(1)
            .create_async()
            .await;

        let client = HttpWorkerClient::new(fast_config());
        let err = client
            .call(&server.host_with_port(), request(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::Malformed(_)), "got: {err}");
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let server = mockito::Server::new_async().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let client = HttpWorkerClient::new(fast_config());
        let err = client
            .call(&server.host_with_port(), request(), &cancel)
            .await
            .unwrap_err();

        match err {
            CallError::Transport(detail) => assert!(detail.contains("cancelled")),
            other => panic!("expected Transport error, got: {other}"),
        }
    }

    #[test]
    fn endpoint_accepts_bare_and_schemed_addresses() {
        assert_eq!(
            HttpWorkerClient::endpoint("127.0.0.1:50060"),
            "http://127.0.0.1:50060/task"
        );
        assert_eq!(
            HttpWorkerClient::endpoint("http://127.0.0.1:50060/"),
            "http://127.0.0.1:50060/task"
        );
    }

    #[test]
    fn delegation_result_passes_structural_validation() {
        let result = WorkerResult {
            task_id: "task_1_a".into(),
            success: true,
            final_content: None,
            error_message: None,
            subtasks: vec![super::super::SubTaskRequest {
                persona: "You are a researcher.".into(),
                task: "Research auth schemes.".into(),
            }],
        };
        assert!(validate_result(result).is_ok());
    }
}
