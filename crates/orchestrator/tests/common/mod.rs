#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use remedy_orchestrator::alert::{Alert, AlertStatus};
use remedy_orchestrator::breaker::CircuitBreaker;
use remedy_orchestrator::config::WorkflowConfig;
use remedy_orchestrator::context::ContextBuilder;
use remedy_orchestrator::escalate::EscalationNotifier;
use remedy_orchestrator::gateway::{Gateway, GatewayRequest, GatewayResult, GatewayStatus};
use remedy_orchestrator::ingest::{AlertIngestor, IncidentRegistry};
use remedy_orchestrator::operations::OperationTranslator;
use remedy_orchestrator::patterns::{MemoryPatternStore, PatternStore};
use remedy_orchestrator::planner::{DiagnosticPlanner, ReasoningClient};
use remedy_orchestrator::workflow::{Incident, IncidentLog, WorkflowEngine};
use remedy_orchestrator::{Error, Result};

/// Scriptable gateway double. Records every request; behavior is keyed by
/// intent.
pub struct FakeGateway {
    calls: Mutex<Vec<GatewayRequest>>,
    transient_failures: Mutex<HashMap<String, u32>>,
    failing_intents: Mutex<HashSet<String>>,
    outputs: Mutex<HashMap<String, String>>,
    delay: Option<Duration>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            transient_failures: Mutex::new(HashMap::new()),
            failing_intents: Mutex::new(HashSet::new()),
            outputs: Mutex::new(HashMap::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The first `n` requests with this intent fail with a transient error.
    pub fn fail_transiently(&self, intent: &str, n: u32) {
        self.transient_failures
            .lock()
            .unwrap()
            .insert(intent.to_string(), n);
    }

    /// Every request with this intent completes with an error status.
    pub fn fail_intent(&self, intent: &str) {
        self.failing_intents
            .lock()
            .unwrap()
            .insert(intent.to_string());
    }

    pub fn set_output(&self, intent: &str, output: &str) {
        self.outputs
            .lock()
            .unwrap()
            .insert(intent.to_string(), output.to_string());
    }

    pub fn calls(&self) -> Vec<GatewayRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn execute(&self, request: &GatewayRequest) -> Result<GatewayResult> {
        self.calls.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut transient = self.transient_failures.lock().unwrap();
            if let Some(remaining) = transient.get_mut(&request.intent) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::TransientExecution("gateway unreachable".to_string()));
                }
            }
        }

        if self.failing_intents.lock().unwrap().contains(&request.intent) {
            return Ok(GatewayResult {
                request_id: Some(Uuid::new_v4().to_string()),
                status: GatewayStatus::Error,
                command: None,
                output: "command failed".to_string(),
                duration_ms: 5,
            });
        }

        let output = self
            .outputs
            .lock()
            .unwrap()
            .get(&request.intent)
            .cloned()
            .unwrap_or_else(|| "ok: service healthy".to_string());
        Ok(GatewayResult {
            request_id: Some(Uuid::new_v4().to_string()),
            status: GatewayStatus::Success,
            command: Some("echo scripted".to_string()),
            output,
            duration_ms: 5,
        })
    }
}

/// Gateway double that dies mid-step, for claim-release coverage.
pub struct PanickingGateway;

#[async_trait]
impl Gateway for PanickingGateway {
    async fn execute(&self, _request: &GatewayRequest) -> Result<GatewayResult> {
        panic!("scripted gateway failure");
    }
}

/// Reasoning double returning one fixed completion.
pub struct FakeReasoning {
    response: String,
}

impl FakeReasoning {
    pub fn with_plan(response: &str) -> Self {
        Self {
            response: response.to_string(),
        }
    }
}

#[async_trait]
impl ReasoningClient for FakeReasoning {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
        Ok(self.response.clone())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notifications: Mutex<Vec<(Uuid, String)>>,
}

#[async_trait]
impl EscalationNotifier for RecordingNotifier {
    async fn notify(&self, incident: &Incident, reason: &str) {
        self.notifications
            .lock()
            .unwrap()
            .push((incident.id, reason.to_string()));
    }
}

/// A standard four-phase plan ending in a mechanical validation check.
pub const STANDARD_PLAN: &str = r#"[
  {"phase": "triage", "operation": "check_resources", "parameters": {}, "reasoning": "baseline"},
  {"phase": "isolation", "operation": "get_logs", "parameters": {"level": "error"}},
  {"phase": "resolution", "operation": "restart_service", "parameters": {}, "critical": true},
  {"phase": "validation", "operation": "health_check", "parameters": {}, "success_criteria": "contains: healthy"}
]"#;

pub struct Harness {
    pub gateway: Arc<FakeGateway>,
    pub breaker: Arc<CircuitBreaker>,
    pub notifier: Arc<RecordingNotifier>,
    pub registry: Arc<IncidentRegistry>,
    pub incidents: Arc<IncidentLog>,
    pub patterns: Arc<MemoryPatternStore>,
    pub ingestor: Arc<AlertIngestor>,
}

pub fn harness(gateway: FakeGateway, plan: &str) -> Harness {
    let gateway = Arc::new(gateway);
    let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(60)));
    let notifier = Arc::new(RecordingNotifier::default());
    let registry = Arc::new(IncidentRegistry::new());
    let incidents = Arc::new(IncidentLog::new());
    let patterns = Arc::new(MemoryPatternStore::new());

    let planner = DiagnosticPlanner::new(
        Arc::new(FakeReasoning::with_plan(plan)),
        patterns.clone() as Arc<dyn PatternStore>,
        5,
        5,
    );
    let engine = Arc::new(WorkflowEngine::new(
        gateway.clone(),
        planner,
        OperationTranslator::new("remedy-test"),
        ContextBuilder::new(Vec::new(), Duration::from_millis(100)),
        breaker.clone(),
        patterns.clone() as Arc<dyn PatternStore>,
        notifier.clone(),
        registry.clone(),
        incidents.clone(),
        WorkflowConfig {
            max_retries: 2,
            backoff_base_ms: 1,
            default_step_timeout_secs: 5,
        },
    ));
    let ingestor = Arc::new(AlertIngestor::new(
        registry.clone(),
        engine,
        "remedy-orchestrator",
    ));

    Harness {
        gateway,
        breaker,
        notifier,
        registry,
        incidents,
        patterns,
        ingestor,
    }
}

/// Minimal wiring for gateway doubles that need no call inspection.
pub fn ingestor_with_gateway(
    gateway: Arc<dyn Gateway>,
    plan: &str,
) -> (Arc<AlertIngestor>, Arc<IncidentRegistry>) {
    let registry = Arc::new(IncidentRegistry::new());
    let patterns = Arc::new(MemoryPatternStore::new());
    let planner = DiagnosticPlanner::new(
        Arc::new(FakeReasoning::with_plan(plan)),
        patterns.clone() as Arc<dyn PatternStore>,
        5,
        5,
    );
    let engine = Arc::new(WorkflowEngine::new(
        gateway,
        planner,
        OperationTranslator::new("remedy-test"),
        ContextBuilder::new(Vec::new(), Duration::from_millis(100)),
        Arc::new(CircuitBreaker::new(3, Duration::from_secs(60))),
        patterns as Arc<dyn PatternStore>,
        Arc::new(RecordingNotifier::default()),
        registry.clone(),
        Arc::new(IncidentLog::new()),
        WorkflowConfig {
            max_retries: 2,
            backoff_base_ms: 1,
            default_step_timeout_secs: 5,
        },
    ));
    let ingestor = Arc::new(AlertIngestor::new(
        registry.clone(),
        engine,
        "remedy-orchestrator",
    ));
    (ingestor, registry)
}

pub fn firing_alert(target: &str, name: &str) -> Alert {
    Alert {
        id: Uuid::new_v4(),
        source: "alertmanager".to_string(),
        target: target.to_string(),
        alert_name: name.to_string(),
        severity: "critical".to_string(),
        description: "service is misbehaving".to_string(),
        labels: HashMap::new(),
        status: AlertStatus::Firing,
        starts_at: Utc::now(),
    }
}

pub fn resolved_alert(target: &str, name: &str) -> Alert {
    let mut alert = firing_alert(target, name);
    alert.status = AlertStatus::Resolved;
    alert
}

/// Polls the incident log until an incident for `target` closes.
pub async fn wait_for_incident(log: &IncidentLog, target: &str) -> Incident {
    for _ in 0..500 {
        if let Some(incident) = log
            .recent()
            .await
            .into_iter()
            .find(|i| i.alert.target == target)
        {
            return incident;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("incident for {target} never closed");
}
