//! Drives one incident from alert to terminal status: admission through the
//! circuit breaker, context gathering, planning, phase-ordered execution
//! with bounded retries, and closure (breaker update, pattern record,
//! escalation, metrics).

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::alert::Alert;
use crate::breaker::{Admission, CircuitBreaker};
use crate::config::WorkflowConfig;
use crate::context::ContextBuilder;
use crate::escalate::EscalationNotifier;
use crate::gateway::Gateway;
use crate::ingest::{IncidentHandle, IncidentRegistry};
use crate::metrics;
use crate::operations::OperationTranslator;
use crate::patterns::{fingerprint_tokens, PatternRecord, PatternStore};
use crate::planner::{DiagnosticPlanner, Phase, PlanStep};
use crate::workflow::{Incident, IncidentLog, IncidentStatus, StepResult, StepStatus};

pub struct WorkflowEngine {
    gateway: Arc<dyn Gateway>,
    planner: DiagnosticPlanner,
    translator: OperationTranslator,
    context_builder: ContextBuilder,
    breaker: Arc<CircuitBreaker>,
    patterns: Arc<dyn PatternStore>,
    notifier: Arc<dyn EscalationNotifier>,
    registry: Arc<IncidentRegistry>,
    log: Arc<IncidentLog>,
    config: WorkflowConfig,
}

/// Why execution stopped before the plan ran to completion.
enum Interruption {
    None,
    Cancelled,
    CircuitOpened,
}

/// Releases the target's registry claim when dropped, so the claim cannot
/// outlive the incident task even if it panics.
struct ClaimRelease {
    registry: Arc<IncidentRegistry>,
    target: String,
}

impl Drop for ClaimRelease {
    fn drop(&mut self) {
        self.registry.release(&self.target);
    }
}

impl WorkflowEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<dyn Gateway>,
        planner: DiagnosticPlanner,
        translator: OperationTranslator,
        context_builder: ContextBuilder,
        breaker: Arc<CircuitBreaker>,
        patterns: Arc<dyn PatternStore>,
        notifier: Arc<dyn EscalationNotifier>,
        registry: Arc<IncidentRegistry>,
        log: Arc<IncidentLog>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            gateway,
            planner,
            translator,
            context_builder,
            breaker,
            patterns,
            notifier,
            registry,
            log,
            config,
        }
    }

    pub fn incident_log(&self) -> Arc<IncidentLog> {
        self.log.clone()
    }

    /// Runs one incident to its terminal status. The target's registry
    /// claim is released on every exit path, panics included.
    pub async fn run_incident(&self, alert: Alert, handle: Arc<IncidentHandle>) {
        let target = alert.target.clone();
        let _claim = ClaimRelease {
            registry: self.registry.clone(),
            target: target.clone(),
        };
        let mut incident = Incident::open(handle.incident_id, alert);

        let admission = self.breaker.admit(&target);
        if admission == Admission::Reject {
            // No context gathering, no planning, no gateway traffic. The
            // outcome is also not fed back into the breaker, or an alert
            // storm would extend the cooldown forever.
            warn!(%target, incident_id = %incident.id, "Circuit open, escalating without execution");
            self.close(
                &handle,
                &mut incident,
                IncidentStatus::Escalated,
                Some("circuit open for target, automated recovery suspended".to_string()),
            )
            .await;
            return;
        }
        if admission == Admission::Trial {
            info!(%target, incident_id = %incident.id, "Running as half-open trial incident");
        }

        incident.context = self.context_builder.gather(&target).await;
        self.absorb_pending(&handle, &mut incident);

        let plan = self.planner.plan(&incident.alert, &incident.context).await;
        incident.step_results = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| StepResult::pending(i, s.phase, s.operation))
            .collect();
        incident.plan = plan.clone();

        let interruption = self.execute_plan(&plan, &handle, &mut incident).await;

        for result in &mut incident.step_results {
            if result.status == StepStatus::Pending {
                result.status = StepStatus::Skipped;
            }
        }

        let (status, reason) = match interruption {
            Interruption::Cancelled => (
                IncidentStatus::Aborted,
                Some("underlying alert resolved while the workflow was running".to_string()),
            ),
            Interruption::CircuitOpened => (
                IncidentStatus::Escalated,
                Some("circuit opened before the resolution phase".to_string()),
            ),
            Interruption::None if plan.fallback => (
                IncidentStatus::Escalated,
                Some("diagnostic plan was unusable, state captured for hand-off".to_string()),
            ),
            Interruption::None => terminal_status(&incident.step_results),
        };

        self.breaker
            .record(&target, status == IncidentStatus::Resolved);
        self.close(&handle, &mut incident, status, reason).await;
    }

    /// Walks the phases in their fixed order. Cancellation and coalesced
    /// alerts are observed between steps, never mid-operation.
    async fn execute_plan(
        &self,
        plan: &crate::planner::DiagnosticPlan,
        handle: &IncidentHandle,
        incident: &mut Incident,
    ) -> Interruption {
        for phase in Phase::ORDER {
            self.absorb_pending(handle, incident);
            if handle.is_cancelled() {
                return Interruption::Cancelled;
            }
            // Another target's incidents may have opened this target's
            // circuit since admission; mutations must not start once it has.
            if phase == Phase::Resolution && self.breaker.is_open(&incident.alert.target) {
                return Interruption::CircuitOpened;
            }

            let indices: Vec<usize> = plan.steps_in(phase).map(|(i, _)| i).collect();
            let mut phase_abandoned = false;
            for i in indices {
                self.absorb_pending(handle, incident);
                if handle.is_cancelled() {
                    return Interruption::Cancelled;
                }
                if phase_abandoned {
                    incident.step_results[i].status = StepStatus::Skipped;
                    continue;
                }

                let step = &plan.steps[i];
                let prior = incident.step_results[..i].to_vec();
                let result = self.execute_step(i, step, &incident.alert, &prior).await;
                let failed_critical = step.critical && !result.success;
                incident.step_results[i] = result;

                if failed_critical && phase != Phase::Validation {
                    warn!(
                        incident_id = %incident.id,
                        operation = step.operation.as_str(),
                        phase = phase.as_str(),
                        "Critical step failed, abandoning remainder of phase"
                    );
                    phase_abandoned = true;
                }
            }
        }
        Interruption::None
    }

    async fn execute_step(
        &self,
        index: usize,
        step: &PlanStep,
        alert: &Alert,
        prior: &[StepResult],
    ) -> StepResult {
        let mut result = StepResult::pending(index, step.phase, step.operation);
        result.status = StepStatus::Running;
        result.started_at = Some(chrono::Utc::now());

        let request = self.translator.translate(step, alert, prior);
        // Only critical steps earn retries; a failed read-only probe is
        // reported as-is.
        let max_attempts = if step.critical {
            self.config.max_retries + 1
        } else {
            1
        };

        for attempt in 1..=max_attempts {
            result.attempts = attempt;
            metrics::GATEWAY_REQUESTS_TOTAL.inc();

            let outcome = tokio::time::timeout(
                Duration::from_secs(step.timeout_secs),
                self.gateway.execute(&request),
            )
            .await;

            let retryable = match outcome {
                Ok(Ok(gateway_result)) => {
                    result.output = gateway_result.output.clone();
                    if gateway_result.is_success() && step.evaluate(&gateway_result.output) {
                        result.success = true;
                        result.error = None;
                        break;
                    }
                    result.error = Some(if gateway_result.is_success() {
                        "output did not meet the step's success criteria".to_string()
                    } else {
                        format!("gateway reported {:?}", gateway_result.status)
                    });
                    true
                }
                Ok(Err(e)) => {
                    let retryable = e.is_transient();
                    result.error = Some(e.to_string());
                    retryable
                }
                Err(_) => {
                    result.error = Some(format!("step timed out after {}s", step.timeout_secs));
                    true
                }
            };

            if !retryable || attempt == max_attempts {
                break;
            }
            let backoff = self.config.backoff_base_ms * 2u64.pow(attempt - 1);
            info!(
                operation = step.operation.as_str(),
                attempt,
                backoff_ms = backoff,
                "Step failed, retrying after backoff"
            );
            tokio::time::sleep(Duration::from_millis(backoff)).await;
        }

        result.finished_at = Some(chrono::Utc::now());
        result.status = if result.success {
            StepStatus::Succeeded
        } else {
            StepStatus::Failed
        };
        result
    }

    fn absorb_pending(&self, handle: &IncidentHandle, incident: &mut Incident) {
        for alert in handle.drain_pending() {
            info!(
                incident_id = %incident.id,
                alert_name = %alert.alert_name,
                "Absorbing coalesced alert"
            );
            incident.context.note_coalesced(alert.summary());
        }
    }

    async fn close(
        &self,
        handle: &IncidentHandle,
        incident: &mut Incident,
        status: IncidentStatus,
        reason: Option<String>,
    ) {
        // Alerts coalesced after the last step boundary still belong to the
        // record and the escalation report.
        self.absorb_pending(handle, incident);
        incident.status = status;
        incident.escalation_reason = reason.clone();
        incident.closed_at = Some(chrono::Utc::now());

        match status {
            IncidentStatus::Resolved => metrics::INCIDENTS_RESOLVED_TOTAL.inc(),
            IncidentStatus::Escalated => metrics::INCIDENTS_ESCALATED_TOTAL.inc(),
            IncidentStatus::Aborted => metrics::INCIDENTS_ABORTED_TOTAL.inc(),
            IncidentStatus::Open => {}
        }

        // Only incidents that actually executed leave a pattern record;
        // circuit-rejected incidents carry no signal about the plan.
        if !incident.step_results.is_empty() {
            let record = PatternRecord {
                id: incident.id,
                target: incident.alert.target.clone(),
                alert_name: incident.alert.alert_name.clone(),
                tokens: fingerprint_tokens(&incident.alert),
                plan_summary: incident.plan.operation_names(),
                outcome: status.as_str().to_string(),
                created_at: chrono::Utc::now(),
            };
            if let Err(e) = self.patterns.append(record).await {
                warn!(incident_id = %incident.id, error = %e, "Failed to append pattern record");
            }
        }

        if status != IncidentStatus::Resolved {
            let reason = reason.unwrap_or_else(|| "automated recovery did not complete".to_string());
            self.notifier.notify(incident, &reason).await;
        }

        info!(
            incident_id = %incident.id,
            target = %incident.alert.target,
            status = status.as_str(),
            "Incident closed"
        );
        self.log.push(incident.clone()).await;
    }
}

/// RESOLVED requires positive confirmation: at least one validation step
/// ran and every validation step succeeded.
fn terminal_status(results: &[StepResult]) -> (IncidentStatus, Option<String>) {
    let validation: Vec<&StepResult> = results
        .iter()
        .filter(|r| r.phase == Phase::Validation)
        .collect();
    if validation.is_empty() {
        return (
            IncidentStatus::Escalated,
            Some("plan contained no validation step, recovery cannot be confirmed".to_string()),
        );
    }
    if let Some(failed) = validation.iter().find(|r| r.status != StepStatus::Succeeded) {
        return (
            IncidentStatus::Escalated,
            Some(format!(
                "validation step {} did not succeed",
                failed.operation.as_str()
            )),
        );
    }
    (IncidentStatus::Resolved, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::OperationKind;

    fn result(phase: Phase, status: StepStatus) -> StepResult {
        let mut r = StepResult::pending(0, phase, OperationKind::HealthCheck);
        r.status = status;
        r.success = status == StepStatus::Succeeded;
        r
    }

    #[test]
    fn resolution_success_alone_does_not_resolve() {
        let (status, reason) = terminal_status(&[result(Phase::Resolution, StepStatus::Succeeded)]);
        assert_eq!(status, IncidentStatus::Escalated);
        assert!(reason.unwrap().contains("no validation step"));
    }

    #[test]
    fn all_validation_steps_must_succeed() {
        let (status, _) = terminal_status(&[
            result(Phase::Resolution, StepStatus::Succeeded),
            result(Phase::Validation, StepStatus::Succeeded),
            result(Phase::Validation, StepStatus::Failed),
        ]);
        assert_eq!(status, IncidentStatus::Escalated);

        let (status, reason) = terminal_status(&[
            result(Phase::Resolution, StepStatus::Failed),
            result(Phase::Validation, StepStatus::Succeeded),
        ]);
        // Validation is the arbiter even when a resolution step failed.
        assert_eq!(status, IncidentStatus::Resolved);
        assert!(reason.is_none());
    }

    #[test]
    fn skipped_validation_escalates() {
        let (status, _) = terminal_status(&[
            result(Phase::Resolution, StepStatus::Succeeded),
            result(Phase::Validation, StepStatus::Skipped),
        ]);
        assert_eq!(status, IncidentStatus::Escalated);
    }
}
