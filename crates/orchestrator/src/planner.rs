//! Multi-phase diagnostic planning. The planner issues exactly one request
//! to the reasoning service per incident and parses the free-form response
//! defensively: unknown operations, missing required parameters and
//! structural damage never reach execution.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::alert::Alert;
use crate::context::Context;
use crate::metrics;
use crate::operations::{whitelist_for_prompt, OperationKind};
use crate::patterns::{fingerprint_tokens, PatternStore, ScoredPattern};
use crate::{Error, Result};

/// Number of same-operation failures on similar fingerprints before the
/// planner tells the reasoning service to stop suggesting it.
const CONSECUTIVE_FAILURE_BAN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Triage,
    Isolation,
    RootCause,
    Resolution,
    Validation,
}

impl Phase {
    /// Fixed execution order. Plans may omit phases but never reorder them.
    pub const ORDER: [Phase; 5] = [
        Phase::Triage,
        Phase::Isolation,
        Phase::RootCause,
        Phase::Resolution,
        Phase::Validation,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "triage" => Some(Self::Triage),
            "isolation" => Some(Self::Isolation),
            // The reasoning service may use either spelling.
            "root_cause" | "analysis" => Some(Self::RootCause),
            "resolution" => Some(Self::Resolution),
            "validation" => Some(Self::Validation),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Triage => "triage",
            Self::Isolation => "isolation",
            Self::RootCause => "root_cause",
            Self::Resolution => "resolution",
            Self::Validation => "validation",
        }
    }

    pub fn index(&self) -> usize {
        Self::ORDER.iter().position(|p| p == self).unwrap_or(0)
    }

    /// An invalid step in a required phase poisons the whole plan.
    pub fn is_required(&self) -> bool {
        matches!(self, Self::Resolution | Self::Validation)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub phase: Phase,
    pub operation: OperationKind,
    pub parameters: Map<String, Value>,
    pub reasoning: String,
    pub success_criteria: Option<String>,
    pub critical: bool,
    pub timeout_secs: u64,
}

impl PlanStep {
    /// Evaluates the step's success predicate against the gateway output.
    /// Criteria prefixed `contains:` or `matches:` are checked mechanically;
    /// anything else is advisory text and the gateway status alone decides.
    pub fn evaluate(&self, output: &str) -> bool {
        match &self.success_criteria {
            None => true,
            Some(criteria) => {
                if let Some(needle) = criteria.strip_prefix("contains:") {
                    output
                        .to_lowercase()
                        .contains(needle.trim().to_lowercase().as_str())
                } else if let Some(pattern) = criteria.strip_prefix("matches:") {
                    Regex::new(&format!("(?i){}", pattern.trim()))
                        .map(|re| re.is_match(output))
                        .unwrap_or(false)
                } else {
                    true
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticPlan {
    pub steps: Vec<PlanStep>,
    /// True when the reasoning output was rejected and this is the minimal
    /// safe fallback (read-only triage plus escalation).
    pub fallback: bool,
    pub created_at: DateTime<Utc>,
}

impl DiagnosticPlan {
    pub fn new(mut steps: Vec<PlanStep>) -> Self {
        // Stable sort: fixed phase order, emitted order within a phase.
        steps.sort_by_key(|s| s.phase.index());
        Self {
            steps,
            fallback: false,
            created_at: Utc::now(),
        }
    }

    pub fn steps_in(&self, phase: Phase) -> impl Iterator<Item = (usize, &PlanStep)> {
        self.steps
            .iter()
            .enumerate()
            .filter(move |(_, s)| s.phase == phase)
    }

    pub fn operation_names(&self) -> Vec<String> {
        self.steps
            .iter()
            .map(|s| s.operation.as_str().to_string())
            .collect()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// OpenAI-compatible chat-completion client.
pub struct OpenAiReasoningClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiReasoningClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build reasoning client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens,
        })
    }
}

#[async_trait]
impl ReasoningClient for OpenAiReasoningClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "temperature": 0.1,
            "max_tokens": self.max_tokens,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ]
        });
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ReasoningService(format!("request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::ReasoningService(format!(
                "unexpected status {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::ReasoningService(format!("response parse error: {e}")))?;
        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| Error::ReasoningService("no completion content".to_string()))
    }
}

const SYSTEM_PROMPT: &str = "You are a senior site reliability engineer creating systematic \
diagnostic and recovery plans for infrastructure incidents. You only ever use the operations \
you are given, and you respond with a JSON array of plan steps.";

pub struct DiagnosticPlanner {
    client: Arc<dyn ReasoningClient>,
    patterns: Arc<dyn PatternStore>,
    top_k: usize,
    default_step_timeout_secs: u64,
}

impl DiagnosticPlanner {
    pub fn new(
        client: Arc<dyn ReasoningClient>,
        patterns: Arc<dyn PatternStore>,
        top_k: usize,
        default_step_timeout_secs: u64,
    ) -> Self {
        Self {
            client,
            patterns,
            top_k,
            default_step_timeout_secs,
        }
    }

    /// Produces a validated, phase-ordered plan. Never fails: unusable
    /// reasoning output degrades to the minimal safe fallback plan.
    pub async fn plan(&self, alert: &Alert, context: &Context) -> DiagnosticPlan {
        let tokens = fingerprint_tokens(alert);
        let similar = self
            .patterns
            .query(&tokens, self.top_k)
            .await
            .unwrap_or_default();
        let banned = banned_operations(&similar);
        let prompt = self.build_prompt(alert, context, &similar, &banned);

        let text = match self.client.complete(SYSTEM_PROMPT, &prompt).await {
            Ok(text) => text,
            Err(e) => {
                warn!(target = %alert.target, error = %e, "Reasoning service unusable, using fallback plan");
                return self.fallback_plan(alert);
            }
        };

        let raw = match extract_step_array(&text) {
            Ok(raw) => raw,
            Err(reason) => {
                warn!(target = %alert.target, reason, "No usable step array in reasoning output");
                return self.fallback_plan(alert);
            }
        };

        match self.validate_steps(raw, alert) {
            Ok(steps) if !steps.is_empty() => {
                let plan = DiagnosticPlan::new(steps);
                info!(
                    target = %alert.target,
                    steps = plan.steps.len(),
                    "Diagnostic plan created"
                );
                plan
            }
            Ok(_) => {
                warn!(target = %alert.target, "Reasoning output contained no valid steps");
                self.fallback_plan(alert)
            }
            Err(reason) => {
                warn!(target = %alert.target, reason, "Plan rejected");
                self.fallback_plan(alert)
            }
        }
    }

    fn build_prompt(
        &self,
        alert: &Alert,
        context: &Context,
        similar: &[ScoredPattern],
        banned: &[OperationKind],
    ) -> String {
        let mut prompt = format!(
            "INFRASTRUCTURE DIAGNOSTIC PLANNING\n\n\
             ## INCIDENT\n\
             Service: {}\nAlert: {}\nSeverity: {}\nDescription: {}\n\
             Incident type: {}\n\n\
             ## CONTEXT SNAPSHOT\n{}\n\n\
             ## AVAILABLE OPERATIONS\n{}\n",
            alert.target,
            alert.alert_name,
            alert.severity,
            alert.description,
            classify(alert),
            context.summary_for_prompt(4000),
            whitelist_for_prompt(),
        );

        if !similar.is_empty() {
            prompt.push_str("\n## SIMILAR PAST INCIDENTS\n");
            for ScoredPattern { score, record } in similar {
                prompt.push_str(&format!(
                    "- {} on {} -> {} (operations: {}, similarity {:.2})\n",
                    record.alert_name,
                    record.target,
                    record.outcome,
                    record.plan_summary.join(", "),
                    score
                ));
            }
        }
        if !banned.is_empty() {
            prompt.push_str("\n## DO NOT USE\n");
            for kind in banned {
                prompt.push_str(&format!(
                    "- {} has failed repeatedly for similar incidents; do not include it\n",
                    kind.as_str()
                ));
            }
        }

        prompt.push_str(
            "\n## OUTPUT FORMAT\n\
             Return a JSON array of step objects:\n\
             [{\"phase\": \"triage|isolation|root_cause|resolution|validation\",\n  \
               \"operation\": \"operation_name\",\n  \
               \"parameters\": {\"target\": \"...\"},\n  \
               \"reasoning\": \"why this step\",\n  \
               \"success_criteria\": \"contains:<text> or matches:<regex> or prose\",\n  \
               \"critical\": true,\n  \
               \"timeout\": 60}]\n\
             Phases execute strictly in the order listed. Include a validation step.\n",
        );
        prompt
    }

    /// Applies the whitelist policy: invalid steps in RESOLUTION or
    /// VALIDATION reject the whole plan; invalid diagnostic steps are
    /// dropped.
    fn validate_steps(&self, raw: Vec<Value>, alert: &Alert) -> std::result::Result<Vec<PlanStep>, String> {
        let mut steps = Vec::new();
        for (i, item) in raw.into_iter().enumerate() {
            let obj = match item.as_object() {
                Some(obj) => obj.clone(),
                // A step that is not an object cannot be attributed to a
                // phase, so it is treated as poisoning the plan.
                None => return Err(format!("step {i} is not an object")),
            };
            let phase = match obj
                .get("phase")
                .and_then(|v| v.as_str())
                .and_then(Phase::parse)
            {
                Some(phase) => phase,
                None => return Err(format!("step {i} has a missing or unknown phase")),
            };

            let operation = obj
                .get("operation")
                .and_then(|v| v.as_str())
                .and_then(OperationKind::parse);
            let operation = match operation {
                Some(op) => op,
                None if phase.is_required() => {
                    return Err(format!("unknown operation in {} phase", phase.as_str()))
                }
                None => {
                    warn!(step = i, "Dropping diagnostic step with unknown operation");
                    continue;
                }
            };

            let mut parameters = obj
                .get("parameters")
                .and_then(|v| v.as_object())
                .cloned()
                .unwrap_or_default();
            // The reasoning service regularly forgets the target parameter.
            parameters
                .entry("target".to_string())
                .or_insert_with(|| Value::String(alert.target.clone()));

            let missing: Vec<&&str> = operation
                .spec()
                .required_params
                .iter()
                .filter(|p| !parameters.contains_key(**p))
                .collect();
            if !missing.is_empty() {
                if phase.is_required() {
                    return Err(format!(
                        "{} step missing required parameter {}",
                        operation.as_str(),
                        missing[0]
                    ));
                }
                warn!(step = i, operation = operation.as_str(), "Dropping step with missing parameters");
                continue;
            }

            let success_criteria = obj
                .get("success_criteria")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            // An uncompilable pattern makes the step unevaluable, so it is
            // rejected here rather than silently failing every attempt.
            if let Some(pattern) = success_criteria
                .as_deref()
                .and_then(|c| c.strip_prefix("matches:"))
            {
                if Regex::new(&format!("(?i){}", pattern.trim())).is_err() {
                    if phase.is_required() {
                        return Err(format!(
                            "unusable success pattern in {} phase",
                            phase.as_str()
                        ));
                    }
                    warn!(step = i, "Dropping step with unusable success pattern");
                    continue;
                }
            }

            let critical = obj
                .get("critical")
                .and_then(|v| v.as_bool())
                .unwrap_or(phase == Phase::Resolution || !operation.spec().read_only);

            steps.push(PlanStep {
                phase,
                operation,
                parameters,
                reasoning: obj
                    .get("reasoning")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                success_criteria,
                critical,
                timeout_secs: obj
                    .get("timeout")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(self.default_step_timeout_secs),
            });
        }
        Ok(steps)
    }

    /// Minimal safe plan: one read-only triage check, then escalation.
    pub fn fallback_plan(&self, alert: &Alert) -> DiagnosticPlan {
        metrics::PLAN_FALLBACKS_TOTAL.inc();
        let mut parameters = Map::new();
        parameters.insert("target".to_string(), Value::String(alert.target.clone()));
        DiagnosticPlan {
            steps: vec![PlanStep {
                phase: Phase::Triage,
                operation: OperationKind::CheckStatus,
                parameters,
                reasoning: "Reasoning output was unusable; capturing current state for the human responder"
                    .to_string(),
                success_criteria: None,
                critical: false,
                timeout_secs: 30,
            }],
            fallback: true,
            created_at: Utc::now(),
        }
    }
}

/// Extracts the JSON step array from free-form reasoning output, tolerating
/// surrounding prose.
fn extract_step_array(text: &str) -> std::result::Result<Vec<Value>, &'static str> {
    let start = text.find('[').ok_or("no JSON array found")?;
    let end = text.rfind(']').ok_or("no JSON array found")?;
    if end <= start {
        return Err("no JSON array found");
    }
    serde_json::from_str(&text[start..=end]).map_err(|_| "step array is not valid JSON")
}

/// Operations that failed on similar fingerprints `CONSECUTIVE_FAILURE_BAN`
/// times in a row, newest first, without an intervening success.
pub fn banned_operations(similar: &[ScoredPattern]) -> Vec<OperationKind> {
    let mut records: Vec<_> = similar.iter().map(|s| &s.record).collect();
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut banned = Vec::new();
    for spec in crate::operations::REGISTRY {
        let name = spec.kind.as_str();
        let mut streak = 0;
        for record in records
            .iter()
            .filter(|r| r.plan_summary.iter().any(|op| op == name))
        {
            if record.outcome == "resolved" {
                break;
            }
            streak += 1;
        }
        if streak >= CONSECUTIVE_FAILURE_BAN {
            banned.push(spec.kind);
        }
    }
    banned
}

fn classify(alert: &Alert) -> &'static str {
    let text = format!("{} {}", alert.alert_name, alert.description).to_lowercase();
    if ["slow", "latency", "timeout"].iter().any(|k| text.contains(k)) {
        "high_latency"
    } else if ["memory", "cpu", "disk", "resource"].iter().any(|k| text.contains(k)) {
        "resource_exhaustion"
    } else if ["deploy", "startup", "config"].iter().any(|k| text.contains(k)) {
        "deployment_failure"
    } else {
        "service_down"
    }
}
