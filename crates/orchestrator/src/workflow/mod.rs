//! Incident state model and the bounded in-memory log of closed incidents.

pub mod engine;

pub use engine::WorkflowEngine;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::alert::Alert;
use crate::context::Context;
use crate::operations::OperationKind;
use crate::planner::{DiagnosticPlan, Phase};

/// Closed incidents kept in memory for the API.
const INCIDENT_LOG_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Resolved,
    Escalated,
    Aborted,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Resolved => "resolved",
            Self::Escalated => "escalated",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub phase: Phase,
    pub operation: OperationKind,
    pub status: StepStatus,
    pub attempts: u32,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn pending(index: usize, phase: Phase, operation: OperationKind) -> Self {
        Self {
            index,
            phase,
            operation,
            status: StepStatus::Pending,
            attempts: 0,
            success: false,
            output: String::new(),
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Full record of one recovery attempt, from alert to terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub alert: Alert,
    pub status: IncidentStatus,
    pub plan: DiagnosticPlan,
    pub step_results: Vec<StepResult>,
    pub context: Context,
    pub escalation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn open(id: Uuid, alert: Alert) -> Self {
        let target = alert.target.clone();
        Self {
            id,
            alert,
            status: IncidentStatus::Open,
            plan: DiagnosticPlan::new(Vec::new()),
            step_results: Vec::new(),
            context: Context::empty(&target),
            escalation_reason: None,
            created_at: Utc::now(),
            closed_at: None,
        }
    }
}

/// Bounded, most-recent-first log of closed incidents.
#[derive(Default)]
pub struct IncidentLog {
    incidents: RwLock<Vec<Incident>>,
}

impl IncidentLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, incident: Incident) {
        let mut incidents = self.incidents.write().await;
        incidents.insert(0, incident);
        incidents.truncate(INCIDENT_LOG_CAP);
    }

    pub async fn recent(&self) -> Vec<Incident> {
        self.incidents.read().await.clone()
    }

    pub async fn find(&self, id: Uuid) -> Option<Incident> {
        self.incidents
            .read()
            .await
            .iter()
            .find(|i| i.id == id)
            .cloned()
    }
}
