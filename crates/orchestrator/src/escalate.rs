//! Escalation reporting. Notification is best-effort: a failed delivery is
//! logged and never changes the incident outcome.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, warn};

use crate::workflow::Incident;

#[async_trait]
pub trait EscalationNotifier: Send + Sync {
    async fn notify(&self, incident: &Incident, reason: &str);
}

/// Renders the hand-off report a human responder picks up from: what
/// happened, what was tried, and why automation stopped.
pub fn escalation_report(incident: &Incident, reason: &str) -> Value {
    let steps: Vec<Value> = incident
        .step_results
        .iter()
        .map(|r| {
            json!({
                "operation": r.operation.as_str(),
                "phase": r.phase.as_str(),
                "status": r.status,
                "attempts": r.attempts,
                "error": r.error,
                "output": r.output.chars().take(500).collect::<String>(),
            })
        })
        .collect();
    json!({
        "incident_id": incident.id,
        "status": incident.status.as_str(),
        "reason": reason,
        "alert": {
            "name": incident.alert.alert_name,
            "target": incident.alert.target,
            "severity": incident.alert.severity,
            "description": incident.alert.description,
        },
        "coalesced_alerts": incident.context.coalesced_alerts,
        "plan_was_fallback": incident.plan.fallback,
        "steps": steps,
        "created_at": incident.created_at,
        "closed_at": incident.closed_at,
    })
}

/// Writes the report to standard output, one JSON document per incident.
pub struct StdoutNotifier;

#[async_trait]
impl EscalationNotifier for StdoutNotifier {
    async fn notify(&self, incident: &Incident, reason: &str) {
        let report = escalation_report(incident, reason);
        warn!(
            incident_id = %incident.id,
            target = %incident.alert.target,
            reason,
            "Escalating incident to human responders"
        );
        println!("{report}");
    }
}

/// Posts the report to an external webhook (pager, chat bridge).
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> crate::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| crate::Error::Config(format!("failed to build webhook client: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    async fn post(&self, report: &Value) -> anyhow::Result<()> {
        let response = self.client.post(&self.url).json(report).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook returned {}", response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl EscalationNotifier for WebhookNotifier {
    async fn notify(&self, incident: &Incident, reason: &str) {
        let report = escalation_report(incident, reason);
        if let Err(e) = self.post(&report).await {
            error!(
                incident_id = %incident.id,
                error = %e,
                "Failed to deliver escalation webhook"
            );
        }
    }
}
