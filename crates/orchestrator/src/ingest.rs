//! Alert intake: structural filtering, per-target mutual exclusion, and
//! coalescing of follow-up alerts into the already-running incident.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::alert::{Alert, AlertStatus};
use crate::metrics;
use crate::workflow::WorkflowEngine;

lazy_static! {
    static ref TARGET_RE: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]*$").expect("target pattern is valid");
}

const KNOWN_SEVERITIES: &[&str] = &["critical", "warning", "info"];

/// Shared control surface for one running incident. Cancellation and
/// coalesced alerts are observed by the workflow at step boundaries only;
/// an in-flight gateway operation is never interrupted.
pub struct IncidentHandle {
    pub incident_id: Uuid,
    pub target: String,
    cancelled: AtomicBool,
    pending: Mutex<Vec<Alert>>,
}

impl IncidentHandle {
    fn new(target: &str) -> Self {
        Self {
            incident_id: Uuid::new_v4(),
            target: target.to_string(),
            cancelled: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn push_alert(&self, alert: Alert) {
        self.pending
            .lock()
            .expect("incident handle lock poisoned")
            .push(alert);
    }

    pub fn drain_pending(&self) -> Vec<Alert> {
        std::mem::take(
            &mut *self
                .pending
                .lock()
                .expect("incident handle lock poisoned"),
        )
    }
}

/// At most one active incident per target.
#[derive(Default)]
pub struct IncidentRegistry {
    active: Mutex<HashMap<String, Arc<IncidentHandle>>>,
}

impl IncidentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the target for a new incident; `None` when one is already
    /// running.
    pub fn claim(&self, target: &str) -> Option<Arc<IncidentHandle>> {
        let mut active = self.active.lock().expect("registry lock poisoned");
        if active.contains_key(target) {
            return None;
        }
        let handle = Arc::new(IncidentHandle::new(target));
        active.insert(target.to_string(), handle.clone());
        Some(handle)
    }

    pub fn get(&self, target: &str) -> Option<Arc<IncidentHandle>> {
        self.active
            .lock()
            .expect("registry lock poisoned")
            .get(target)
            .cloned()
    }

    pub fn release(&self, target: &str) {
        self.active
            .lock()
            .expect("registry lock poisoned")
            .remove(target);
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("registry lock poisoned").len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new incident was started.
    Accepted { incident_id: Uuid },
    /// Merged into the incident already running for the target.
    Coalesced { incident_id: Uuid },
    /// A resolved alert cancelled the running incident.
    Cancelled { incident_id: Uuid },
    /// Dropped by a structural filter (self-reference, stale resolved).
    Filtered,
    /// Malformed alert.
    Rejected(String),
}

pub struct AlertIngestor {
    registry: Arc<IncidentRegistry>,
    engine: Arc<WorkflowEngine>,
    self_identity: String,
}

impl AlertIngestor {
    pub fn new(
        registry: Arc<IncidentRegistry>,
        engine: Arc<WorkflowEngine>,
        self_identity: &str,
    ) -> Self {
        Self {
            registry,
            engine,
            self_identity: self_identity.to_string(),
        }
    }

    pub async fn receive(&self, alert: Alert) -> IngestOutcome {
        metrics::ALERTS_RECEIVED_TOTAL.inc();

        // The self-reference filter runs before everything else, including
        // validation: the orchestrator must never attempt to recover itself.
        if alert.target == self.self_identity {
            metrics::ALERTS_FILTERED_TOTAL.inc();
            info!(
                alert_name = %alert.alert_name,
                "Dropping alert targeting the orchestrator itself"
            );
            return IngestOutcome::Filtered;
        }

        if let Err(reason) = validate(&alert) {
            metrics::ALERTS_REJECTED_TOTAL.inc();
            warn!(target = %alert.target, reason, "Rejecting malformed alert");
            return IngestOutcome::Rejected(reason);
        }

        if alert.status == AlertStatus::Resolved {
            return match self.registry.get(&alert.target) {
                Some(handle) => {
                    info!(
                        target = %alert.target,
                        incident_id = %handle.incident_id,
                        "Resolved alert received, cancelling running incident"
                    );
                    handle.cancel();
                    IngestOutcome::Cancelled {
                        incident_id: handle.incident_id,
                    }
                }
                None => {
                    metrics::ALERTS_FILTERED_TOTAL.inc();
                    IngestOutcome::Filtered
                }
            };
        }

        match self.registry.claim(&alert.target) {
            None => {
                // Dedup: the running incident absorbs the new alert at its
                // next step boundary.
                let handle = match self.registry.get(&alert.target) {
                    Some(handle) => handle,
                    // The incident closed between the claim attempt and the
                    // lookup; treat the alert as already handled.
                    None => {
                        metrics::ALERTS_FILTERED_TOTAL.inc();
                        return IngestOutcome::Filtered;
                    }
                };
                info!(
                    target = %alert.target,
                    incident_id = %handle.incident_id,
                    "Coalescing alert into running incident"
                );
                handle.push_alert(alert);
                IngestOutcome::Coalesced {
                    incident_id: handle.incident_id,
                }
            }
            Some(handle) => {
                let incident_id = handle.incident_id;
                info!(
                    target = %alert.target,
                    %incident_id,
                    alert_name = %alert.alert_name,
                    "Starting incident"
                );
                let engine = self.engine.clone();
                tokio::spawn(async move {
                    engine.run_incident(alert, handle).await;
                });
                IngestOutcome::Accepted { incident_id }
            }
        }
    }
}

fn validate(alert: &Alert) -> std::result::Result<(), String> {
    if alert.target.is_empty() {
        return Err("alert has no recognizable target label".to_string());
    }
    if !TARGET_RE.is_match(&alert.target) {
        return Err(format!("target contains invalid characters: {}", alert.target));
    }
    if alert.alert_name.is_empty() {
        return Err("alert has no name".to_string());
    }
    if !KNOWN_SEVERITIES
        .iter()
        .any(|s| alert.severity.eq_ignore_ascii_case(s))
    {
        return Err(format!("unknown severity: {}", alert.severity));
    }
    Ok(())
}
