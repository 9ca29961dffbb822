//! Closed whitelist of operations the orchestrator may ask the gateway to
//! perform, plus the translator that turns a plan step into a gateway
//! request. Unknown operations are rejected at plan-parse time, never at
//! execution time.

use serde::{Deserialize, Serialize};

use crate::alert::Alert;
use crate::gateway::{GatewayRequest, Priority};
use crate::planner::{Phase, PlanStep};
use crate::workflow::StepResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CheckResources,
    GetLogs,
    HealthCheck,
    CheckStatus,
    RestartService,
    ScaleService,
}

pub struct OperationSpec {
    pub kind: OperationKind,
    /// Canonical short natural-language intent (kept under ~6 words; the
    /// gateway's execution semantics are defined per single intent).
    pub intent: &'static str,
    pub description: &'static str,
    pub required_params: &'static [&'static str],
    pub optional_params: &'static [&'static str],
    pub read_only: bool,
    pub default_priority: Priority,
}

pub const REGISTRY: &[OperationSpec] = &[
    OperationSpec {
        kind: OperationKind::CheckResources,
        intent: "show memory and CPU usage",
        description: "Resource utilization snapshot for the target service",
        required_params: &[],
        optional_params: &["metrics", "format"],
        read_only: true,
        default_priority: Priority::Low,
    },
    OperationSpec {
        kind: OperationKind::GetLogs,
        intent: "show recent logs",
        description: "Tail of the service log, optionally filtered by level",
        required_params: &[],
        optional_params: &["lines", "level", "since"],
        read_only: true,
        default_priority: Priority::Low,
    },
    OperationSpec {
        kind: OperationKind::HealthCheck,
        intent: "check if service is healthy",
        description: "Probe the service health endpoints",
        required_params: &[],
        optional_params: &["endpoints", "retries"],
        read_only: true,
        default_priority: Priority::Normal,
    },
    OperationSpec {
        kind: OperationKind::CheckStatus,
        intent: "check container status",
        description: "Current run state of the service container or unit",
        required_params: &[],
        optional_params: &[],
        read_only: true,
        default_priority: Priority::Low,
    },
    OperationSpec {
        kind: OperationKind::RestartService,
        intent: "restart the service",
        description: "Restart the target service",
        required_params: &[],
        optional_params: &["strategy"],
        read_only: false,
        default_priority: Priority::High,
    },
    OperationSpec {
        kind: OperationKind::ScaleService,
        intent: "scale the service",
        description: "Change the number of service replicas",
        required_params: &["replicas"],
        optional_params: &["strategy"],
        read_only: false,
        default_priority: Priority::High,
    },
];

impl OperationKind {
    /// Accepts the canonical snake_case names plus the short aliases the
    /// reasoning service tends to emit.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "check_resources" | "resources" => Some(Self::CheckResources),
            "get_logs" | "logs" => Some(Self::GetLogs),
            "health_check" | "healthcheck" => Some(Self::HealthCheck),
            "check_status" | "status" => Some(Self::CheckStatus),
            "restart_service" | "restart" => Some(Self::RestartService),
            "scale_service" | "scale" => Some(Self::ScaleService),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckResources => "check_resources",
            Self::GetLogs => "get_logs",
            Self::HealthCheck => "health_check",
            Self::CheckStatus => "check_status",
            Self::RestartService => "restart_service",
            Self::ScaleService => "scale_service",
        }
    }

    pub fn spec(&self) -> &'static OperationSpec {
        REGISTRY
            .iter()
            .find(|s| s.kind == *self)
            .expect("every operation kind has a registry entry")
    }
}

/// Renders the whitelist with parameter schemas for the reasoning prompt.
pub fn whitelist_for_prompt() -> String {
    let mut out = String::new();
    for spec in REGISTRY {
        out.push_str(&format!("- **{}**: {}\n", spec.kind.as_str(), spec.description));
        if !spec.required_params.is_empty() {
            out.push_str(&format!(
                "  Required parameters: {}\n",
                spec.required_params.join(", ")
            ));
        }
        if !spec.optional_params.is_empty() {
            out.push_str(&format!(
                "  Optional parameters: {}\n",
                spec.optional_params.join(", ")
            ));
        }
    }
    out
}

/// Converts an abstract plan step into a gateway request: a terse intent,
/// with all technical detail pushed into the context string.
pub struct OperationTranslator {
    source_id: String,
}

impl OperationTranslator {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
        }
    }

    pub fn translate(&self, step: &PlanStep, alert: &Alert, prior: &[StepResult]) -> GatewayRequest {
        let spec = step.operation.spec();
        let intent = self.intent_for(step, spec.intent);
        GatewayRequest {
            source_id: self.source_id.clone(),
            target: alert.target.clone(),
            intent,
            context: self.context_for(step, alert, prior),
            priority: self.priority_for(step, alert),
        }
    }

    fn intent_for(&self, step: &PlanStep, canonical: &str) -> String {
        // The only intent variant: error-level log tails get their own phrase.
        if step.operation == OperationKind::GetLogs
            && step
                .parameters
                .get("level")
                .and_then(|v| v.as_str())
                .is_some_and(|l| l.eq_ignore_ascii_case("error"))
        {
            return "show recent error logs".to_string();
        }
        canonical.to_string()
    }

    fn context_for(&self, step: &PlanStep, alert: &Alert, prior: &[StepResult]) -> String {
        let mut context = format!("Incident: {}.", alert.summary());
        if !step.parameters.is_empty() {
            let params: Vec<String> = step
                .parameters
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            context.push_str(&format!(" Parameters: {}.", params.join(", ")));
        }
        if !step.reasoning.is_empty() {
            context.push_str(&format!(" Reasoning: {}.", step.reasoning));
        }
        // Last few step outcomes give the gateway's own translation layer
        // enough history without unbounded growth.
        for result in prior.iter().rev().take(3).rev() {
            let outcome = if result.success { "ok" } else { "failed" };
            let mut output = result.output.clone();
            crate::truncate_to_boundary(&mut output, 200);
            context.push_str(&format!(
                " Earlier step {} {}: {}.",
                result.operation.as_str(),
                outcome,
                output
            ));
        }
        context
    }

    fn priority_for(&self, step: &PlanStep, alert: &Alert) -> Priority {
        let spec = step.operation.spec();
        // Mutating steps outside RESOLUTION, or on non-critical alerts, run
        // at NORMAL rather than the registry's HIGH default.
        if !spec.read_only
            && (step.phase != Phase::Resolution || !alert.severity.eq_ignore_ascii_case("critical"))
        {
            return Priority::Normal;
        }
        spec.default_priority
    }
}
