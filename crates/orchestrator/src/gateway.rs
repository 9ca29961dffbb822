//! Client for the external command-execution gateway.
//!
//! Every infrastructure action goes through this single auditable point.
//! There is deliberately no local execution fallback: if the gateway is
//! unreachable the step fails and the workflow's failure policy takes over.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "LOW"),
            Priority::Normal => write!(f, "NORMAL"),
            Priority::High => write!(f, "HIGH"),
        }
    }
}

/// Exactly one operation per request; batching is disallowed by contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub source_id: String,
    pub target: String,
    pub intent: String,
    pub context: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResult {
    pub request_id: Option<String>,
    pub status: GatewayStatus,
    /// The concrete command the gateway chose to run; opaque to us.
    pub command: Option<String>,
    pub output: String,
    pub duration_ms: u64,
}

impl GatewayResult {
    pub fn is_success(&self) -> bool {
        self.status == GatewayStatus::Success
    }
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn execute(&self, request: &GatewayRequest) -> Result<GatewayResult>;
}

pub struct HttpGatewayClient {
    client: Client,
    base_url: String,
}

impl HttpGatewayClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build gateway client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Gateway for HttpGatewayClient {
    async fn execute(&self, request: &GatewayRequest) -> Result<GatewayResult> {
        let body = json!({
            "source_id": request.source_id,
            "target_resource": { "name": request.target },
            "action_request": {
                "intent": request.intent,
                "context": request.context,
                "priority": request.priority,
            }
        });

        info!(
            target_resource = %request.target,
            intent = %request.intent,
            priority = %request.priority,
            "Executing gateway operation"
        );
        let started = std::time::Instant::now();

        let response = self
            .client
            .post(format!("{}/execute-command", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(target_resource = %request.target, error = %e, "Gateway request failed");
                if e.is_timeout() {
                    Error::TransientExecution(format!("gateway request timed out: {e}"))
                } else {
                    Error::TransientExecution(format!("gateway unreachable: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            warn!(target_resource = %request.target, %status, "Gateway rejected command");
            return Err(Error::PermanentExecution(format!(
                "gateway rejected command ({status}): {detail}"
            )));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::TransientExecution(format!(
                "gateway unavailable ({status}): {detail}"
            )));
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("gateway response parse error: {e}")))?;

        let result = convert_response(&raw, started.elapsed().as_millis() as u64);
        debug!(
            target_resource = %request.target,
            request_id = ?result.request_id,
            status = ?result.status,
            "Gateway operation completed"
        );
        Ok(result)
    }
}

/// Converts the gateway wire response into our result shape, combining
/// stdout and stderr into one output field.
pub fn convert_response(raw: &serde_json::Value, fallback_duration_ms: u64) -> GatewayResult {
    let overall = raw
        .get("overall_status")
        .and_then(|v| v.as_str())
        .unwrap_or("UNKNOWN");
    let status = if overall == "COMPLETED_SUCCESS" {
        GatewayStatus::Success
    } else if overall.contains("TIMEOUT") {
        GatewayStatus::Timeout
    } else {
        GatewayStatus::Error
    };

    let details = raw.get("execution_details").cloned().unwrap_or_default();
    let command = details
        .get("command")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let exec = details.get("execution_result").cloned().unwrap_or_default();
    let stdout = exec.get("stdout").and_then(|v| v.as_str()).unwrap_or("");
    let stderr = exec.get("stderr").and_then(|v| v.as_str()).unwrap_or("");
    let output = match (stdout.is_empty(), stderr.is_empty()) {
        (false, false) => format!("STDOUT:\n{stdout}\n\nSTDERR:\n{stderr}"),
        (false, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (true, true) => raw
            .get("error_details")
            .and_then(|d| d.get("error_message"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
    };

    let duration_ms = details
        .get("execution_time_ms")
        .and_then(|v| v.as_u64())
        .unwrap_or(fallback_duration_ms);

    GatewayResult {
        request_id: raw
            .get("request_id")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        status,
        command,
        output,
        duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_successful_response() {
        let raw = json!({
            "request_id": "req-1",
            "timestamp_processed_utc": "2024-01-01T00:00:00Z",
            "overall_status": "COMPLETED_SUCCESS",
            "execution_details": {
                "command": "systemctl restart svc-a",
                "execution_result": {"stdout": "restarted", "stderr": "", "exit_code": 0},
                "execution_time_ms": 420
            }
        });
        let result = convert_response(&raw, 0);
        assert!(result.is_success());
        assert_eq!(result.request_id.as_deref(), Some("req-1"));
        assert_eq!(result.command.as_deref(), Some("systemctl restart svc-a"));
        assert_eq!(result.output, "restarted");
        assert_eq!(result.duration_ms, 420);
    }

    #[test]
    fn converts_failed_response_with_error_detail() {
        let raw = json!({
            "request_id": "req-2",
            "overall_status": "COMPLETED_FAILURE",
            "error_details": {"error_message": "no such unit"}
        });
        let result = convert_response(&raw, 17);
        assert_eq!(result.status, GatewayStatus::Error);
        assert_eq!(result.output, "no such unit");
        assert_eq!(result.duration_ms, 17);
    }

    #[test]
    fn combines_stdout_and_stderr() {
        let raw = json!({
            "overall_status": "COMPLETED_FAILURE",
            "execution_details": {
                "execution_result": {"stdout": "partial", "stderr": "boom"}
            }
        });
        let result = convert_response(&raw, 0);
        assert!(result.output.contains("STDOUT:\npartial"));
        assert!(result.output.contains("STDERR:\nboom"));
    }

    #[test]
    fn timeout_status_is_detected() {
        let raw = json!({"overall_status": "EXECUTION_TIMEOUT"});
        let result = convert_response(&raw, 0);
        assert_eq!(result.status, GatewayStatus::Timeout);
    }

    #[test]
    fn priority_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "\"HIGH\"");
    }
}
