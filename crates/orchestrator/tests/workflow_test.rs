//! End-to-end workflow behavior against scriptable gateway and reasoning
//! doubles: happy path, failure escalation, coalescing, cancellation and
//! circuit-breaker admission.

mod common;

use std::time::Duration;

use common::*;
use remedy_orchestrator::ingest::IngestOutcome;
use remedy_orchestrator::workflow::{IncidentStatus, StepStatus};

#[tokio::test]
async fn healthy_run_resolves_incident() {
    let h = harness(FakeGateway::new(), STANDARD_PLAN);

    let outcome = h.ingestor.receive(firing_alert("svc-a", "ServiceDown")).await;
    assert!(matches!(outcome, IngestOutcome::Accepted { .. }));

    let incident = wait_for_incident(&h.incidents, "svc-a").await;
    assert_eq!(incident.status, IncidentStatus::Resolved);
    assert_eq!(incident.step_results.len(), incident.plan.steps.len());
    assert!(incident
        .step_results
        .iter()
        .all(|r| r.status == StepStatus::Succeeded));

    // One gateway call per step, error-level log tail gets its phrase.
    let calls = h.gateway.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls.iter().any(|c| c.intent == "show recent error logs"));
    assert!(calls.iter().any(|c| c.intent == "restart the service"));

    // Step timestamps never run backwards.
    let finished: Vec<_> = incident
        .step_results
        .iter()
        .map(|r| r.finished_at.unwrap())
        .collect();
    assert!(finished.windows(2).all(|w| w[0] <= w[1]));

    // Resolution left no escalation and reset the target's failure count.
    assert!(h.notifier.notifications.lock().unwrap().is_empty());
    assert_eq!(h.breaker.failure_count("svc-a"), 0);
    assert_eq!(h.registry.active_count(), 0);
}

#[tokio::test]
async fn failed_validation_escalates() {
    let gateway = FakeGateway::new();
    gateway.set_output("check if service is healthy", "still returning 500s");
    let h = harness(gateway, STANDARD_PLAN);

    h.ingestor.receive(firing_alert("svc-b", "ServiceDown")).await;
    let incident = wait_for_incident(&h.incidents, "svc-b").await;

    assert_eq!(incident.status, IncidentStatus::Escalated);
    let reason = incident.escalation_reason.unwrap();
    assert!(reason.contains("health_check"), "unexpected reason: {reason}");

    let notifications = h.notifier.notifications.lock().unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].0, incident.id);
    assert_eq!(h.breaker.failure_count("svc-b"), 1);
}

#[tokio::test]
async fn critical_step_retries_with_bounded_attempts() {
    let gateway = FakeGateway::new();
    gateway.fail_intent("restart the service");
    gateway.set_output("check if service is healthy", "still returning 500s");
    let h = harness(gateway, STANDARD_PLAN);

    h.ingestor.receive(firing_alert("svc-c", "ServiceDown")).await;
    let incident = wait_for_incident(&h.incidents, "svc-c").await;

    assert_eq!(incident.status, IncidentStatus::Escalated);
    let restart = incident
        .step_results
        .iter()
        .find(|r| r.operation.as_str() == "restart_service")
        .unwrap();
    assert_eq!(restart.status, StepStatus::Failed);
    // max_retries = 2, so three attempts in total.
    assert_eq!(restart.attempts, 3);

    // Validation still ran after the failed resolution phase.
    let validation = incident
        .step_results
        .iter()
        .find(|r| r.operation.as_str() == "health_check")
        .unwrap();
    assert_eq!(validation.status, StepStatus::Failed);
}

#[tokio::test]
async fn transient_failure_recovers_within_retry_limit() {
    let gateway = FakeGateway::new();
    gateway.fail_transiently("restart the service", 2);
    let h = harness(gateway, STANDARD_PLAN);

    h.ingestor.receive(firing_alert("svc-d", "ServiceDown")).await;
    let incident = wait_for_incident(&h.incidents, "svc-d").await;

    assert_eq!(incident.status, IncidentStatus::Resolved);
    let restart = incident
        .step_results
        .iter()
        .find(|r| r.operation.as_str() == "restart_service")
        .unwrap();
    assert_eq!(restart.attempts, 3);
    assert_eq!(restart.status, StepStatus::Succeeded);
}

#[tokio::test]
async fn duplicate_alert_coalesces_into_running_incident() {
    let gateway = FakeGateway::new().with_delay(Duration::from_millis(50));
    let h = harness(gateway, STANDARD_PLAN);

    let first = h.ingestor.receive(firing_alert("svc-e", "ServiceDown")).await;
    assert!(matches!(first, IngestOutcome::Accepted { .. }));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = h
        .ingestor
        .receive(firing_alert("svc-e", "HighErrorRate"))
        .await;
    assert!(matches!(second, IngestOutcome::Coalesced { .. }));

    let incident = wait_for_incident(&h.incidents, "svc-e").await;
    assert_eq!(h.incidents.recent().await.len(), 1);
    assert_eq!(incident.context.coalesced_alerts.len(), 1);
    assert!(incident.context.coalesced_alerts[0].contains("HighErrorRate"));
}

#[tokio::test]
async fn alert_coalesced_during_final_step_reaches_the_record() {
    let gateway = FakeGateway::new().with_delay(Duration::from_millis(200));
    let h = harness(gateway, STANDARD_PLAN);

    h.ingestor.receive(firing_alert("svc-m", "ServiceDown")).await;
    // Lands while the last (validation) step is already executing, after
    // every step boundary has passed.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let outcome = h
        .ingestor
        .receive(firing_alert("svc-m", "HighErrorRate"))
        .await;
    assert!(matches!(outcome, IngestOutcome::Coalesced { .. }));

    let incident = wait_for_incident(&h.incidents, "svc-m").await;
    assert!(incident
        .context
        .coalesced_alerts
        .iter()
        .any(|s| s.contains("HighErrorRate")));
}

#[tokio::test]
async fn dying_incident_task_releases_the_target_claim() {
    use std::sync::Arc;

    let (ingestor, registry) =
        ingestor_with_gateway(Arc::new(PanickingGateway), STANDARD_PLAN);

    let outcome = ingestor.receive(firing_alert("svc-n", "ServiceDown")).await;
    assert!(matches!(outcome, IngestOutcome::Accepted { .. }));

    for _ in 0..500 {
        if registry.active_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(registry.active_count(), 0);

    // The target is claimable again instead of coalescing into a dead task.
    let outcome = ingestor.receive(firing_alert("svc-n", "ServiceDown")).await;
    assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
}

#[tokio::test]
async fn resolved_alert_cancels_running_incident() {
    let gateway = FakeGateway::new().with_delay(Duration::from_millis(100));
    let h = harness(gateway, STANDARD_PLAN);

    h.ingestor.receive(firing_alert("svc-f", "ServiceDown")).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    let outcome = h
        .ingestor
        .receive(resolved_alert("svc-f", "ServiceDown"))
        .await;
    assert!(matches!(outcome, IngestOutcome::Cancelled { .. }));

    let incident = wait_for_incident(&h.incidents, "svc-f").await;
    assert_eq!(incident.status, IncidentStatus::Aborted);
    // Whatever had not started was skipped, not executed.
    assert!(incident
        .step_results
        .iter()
        .any(|r| r.status == StepStatus::Skipped));
    assert!(h.gateway.call_count() < incident.plan.steps.len());
}

#[tokio::test]
async fn resolved_alert_without_incident_is_filtered() {
    let h = harness(FakeGateway::new(), STANDARD_PLAN);
    let outcome = h
        .ingestor
        .receive(resolved_alert("svc-g", "ServiceDown"))
        .await;
    assert_eq!(outcome, IngestOutcome::Filtered);
    assert_eq!(h.gateway.call_count(), 0);
}

#[tokio::test]
async fn self_referential_alert_never_starts_an_incident() {
    let h = harness(FakeGateway::new(), STANDARD_PLAN);
    let outcome = h
        .ingestor
        .receive(firing_alert("remedy-orchestrator", "ServiceDown"))
        .await;
    assert_eq!(outcome, IngestOutcome::Filtered);
    assert_eq!(h.registry.active_count(), 0);
    assert_eq!(h.gateway.call_count(), 0);
}

#[tokio::test]
async fn open_circuit_escalates_with_zero_gateway_traffic() {
    let h = harness(FakeGateway::new(), STANDARD_PLAN);
    // Trip the breaker for the target before any alert arrives.
    for _ in 0..3 {
        h.breaker.record("svc-h", false);
    }

    h.ingestor.receive(firing_alert("svc-h", "ServiceDown")).await;
    let incident = wait_for_incident(&h.incidents, "svc-h").await;

    assert_eq!(incident.status, IncidentStatus::Escalated);
    assert!(incident.step_results.is_empty());
    assert_eq!(h.gateway.call_count(), 0);
    assert!(incident
        .escalation_reason
        .unwrap()
        .contains("circuit open"));
}

#[tokio::test]
async fn unusable_plan_runs_fallback_and_escalates() {
    let h = harness(FakeGateway::new(), "I would simply restart the service.");

    h.ingestor.receive(firing_alert("svc-i", "ServiceDown")).await;
    let incident = wait_for_incident(&h.incidents, "svc-i").await;

    assert_eq!(incident.status, IncidentStatus::Escalated);
    assert!(incident.plan.fallback);
    // Exactly the single read-only state capture ran.
    let calls = h.gateway.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].intent, "check container status");
    let triage = &incident.step_results[0];
    assert_eq!(triage.status, StepStatus::Succeeded);
}

#[tokio::test]
async fn closed_incident_leaves_a_pattern_record() {
    use remedy_orchestrator::patterns::PatternStore;

    let h = harness(FakeGateway::new(), STANDARD_PLAN);
    h.ingestor.receive(firing_alert("svc-j", "HighMemory")).await;
    let incident = wait_for_incident(&h.incidents, "svc-j").await;
    assert_eq!(incident.status, IncidentStatus::Resolved);

    let tokens = remedy_orchestrator::patterns::fingerprint_tokens(&incident.alert);
    let records = h.patterns.query(&tokens, 5).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].record.outcome, "resolved");
    assert!(records[0]
        .record
        .plan_summary
        .contains(&"restart_service".to_string()));
}
