//! Alert model and the Alertmanager-compatible webhook payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// One health alert about a monitored service. Immutable once built from the
/// webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub source: String,
    pub target: String,
    pub alert_name: String,
    pub severity: String,
    pub description: String,
    pub labels: HashMap<String, String>,
    pub status: AlertStatus,
    pub starts_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAlert {
    pub status: String,
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(rename = "startsAt", default = "Utc::now")]
    pub starts_at: DateTime<Utc>,
    #[serde(rename = "endsAt", default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// Alertmanager webhook payload. One POST may carry several alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertmanagerWebhook {
    #[serde(default)]
    pub version: String,
    pub status: String,
    #[serde(default)]
    pub receiver: String,
    #[serde(rename = "groupLabels", default)]
    pub group_labels: HashMap<String, String>,
    #[serde(rename = "commonLabels", default)]
    pub common_labels: HashMap<String, String>,
    #[serde(rename = "commonAnnotations", default)]
    pub common_annotations: HashMap<String, String>,
    pub alerts: Vec<WebhookAlert>,
}

impl Alert {
    /// Builds the domain alert from one webhook entry. Target resolution
    /// follows the label precedence service > job > container > instance.
    pub fn from_webhook(source: &str, raw: &WebhookAlert) -> Self {
        let target = ["service", "job", "container", "instance"]
            .iter()
            .find_map(|key| raw.labels.get(*key))
            .cloned()
            .unwrap_or_default();

        let description = raw
            .annotations
            .get("description")
            .or_else(|| raw.annotations.get("summary"))
            .cloned()
            .unwrap_or_default();

        let status = if raw.status.eq_ignore_ascii_case("resolved") {
            AlertStatus::Resolved
        } else {
            AlertStatus::Firing
        };

        Alert {
            id: Uuid::new_v4(),
            source: source.to_string(),
            target,
            alert_name: raw
                .labels
                .get("alertname")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
            severity: raw.labels.get("severity").cloned().unwrap_or_default(),
            description,
            labels: raw.labels.clone(),
            status,
            starts_at: raw.starts_at,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == AlertStatus::Resolved
    }

    /// One-line form used in reasoning prompts and escalation reports.
    pub fn summary(&self) -> String {
        format!(
            "[{}] {} on {}: {}",
            self.severity, self.alert_name, self.target, self.description
        )
    }
}
