use lazy_static::lazy_static;
use prometheus::{register_int_counter, Encoder, IntCounter, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref ALERTS_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        "remedy_alerts_received_total",
        "Total number of alerts delivered to the ingestor."
    )
    .unwrap();
    pub static ref ALERTS_FILTERED_TOTAL: IntCounter = register_int_counter!(
        "remedy_alerts_filtered_total",
        "Alerts dropped by the structural filters (self-reference, stale resolved)."
    )
    .unwrap();
    pub static ref ALERTS_REJECTED_TOTAL: IntCounter = register_int_counter!(
        "remedy_alerts_rejected_total",
        "Malformed alerts rejected at validation."
    )
    .unwrap();
    pub static ref INCIDENTS_RESOLVED_TOTAL: IntCounter = register_int_counter!(
        "remedy_incidents_resolved_total",
        "Incidents closed with status RESOLVED."
    )
    .unwrap();
    pub static ref INCIDENTS_ESCALATED_TOTAL: IntCounter = register_int_counter!(
        "remedy_incidents_escalated_total",
        "Incidents closed with status ESCALATED."
    )
    .unwrap();
    pub static ref INCIDENTS_ABORTED_TOTAL: IntCounter = register_int_counter!(
        "remedy_incidents_aborted_total",
        "Incidents closed with status ABORTED."
    )
    .unwrap();
    pub static ref GATEWAY_REQUESTS_TOTAL: IntCounter = register_int_counter!(
        "remedy_gateway_requests_total",
        "Operations sent to the execution gateway."
    )
    .unwrap();
    pub static ref PLAN_FALLBACKS_TOTAL: IntCounter = register_int_counter!(
        "remedy_plan_fallbacks_total",
        "Diagnostic plans replaced by the minimal safe fallback."
    )
    .unwrap();
}

pub fn register_metrics() {
    for counter in [
        ALERTS_RECEIVED_TOTAL.clone(),
        ALERTS_FILTERED_TOTAL.clone(),
        ALERTS_REJECTED_TOTAL.clone(),
        INCIDENTS_RESOLVED_TOTAL.clone(),
        INCIDENTS_ESCALATED_TOTAL.clone(),
        INCIDENTS_ABORTED_TOTAL.clone(),
        GATEWAY_REQUESTS_TOTAL.clone(),
        PLAN_FALLBACKS_TOTAL.clone(),
    ] {
        // Ignore AlreadyReg errors so tests can wire the server repeatedly.
        let _ = REGISTRY.register(Box::new(counter));
    }
}

pub fn gather_metrics() -> String {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}
