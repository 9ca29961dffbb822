use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::Server;
use crate::alert::{Alert, AlertmanagerWebhook};
use crate::ingest::IngestOutcome;
use crate::metrics::gather_metrics;

pub async fn health() -> Response {
    Json(json!({
        "status": "healthy",
        "service": "remedy-orchestrator",
    }))
    .into_response()
}

/// Per-batch ingestion tally returned to the webhook sender.
#[derive(Debug, Default, Serialize)]
pub struct WebhookResponse {
    pub accepted: usize,
    pub coalesced: usize,
    pub cancelled: usize,
    pub filtered: usize,
    pub rejected: usize,
}

pub async fn webhook_alerts(
    State(server): State<Arc<Server>>,
    Json(payload): Json<AlertmanagerWebhook>,
) -> Response {
    info!(
        receiver = %payload.receiver,
        alerts = payload.alerts.len(),
        "Received alert webhook"
    );

    let mut tally = WebhookResponse::default();
    for raw in &payload.alerts {
        let alert = Alert::from_webhook("alertmanager", raw);
        match server.ingestor.receive(alert).await {
            IngestOutcome::Accepted { .. } => tally.accepted += 1,
            IngestOutcome::Coalesced { .. } => tally.coalesced += 1,
            IngestOutcome::Cancelled { .. } => tally.cancelled += 1,
            IngestOutcome::Filtered => tally.filtered += 1,
            IngestOutcome::Rejected(_) => tally.rejected += 1,
        }
    }

    // Rejections are per-alert; the batch itself is always acknowledged so
    // Alertmanager does not retry the whole group.
    (StatusCode::OK, Json(tally)).into_response()
}

pub async fn list_incidents(State(server): State<Arc<Server>>) -> Response {
    let incidents = server.incidents.recent().await;
    Json(incidents).into_response()
}

pub async fn get_incident(
    State(server): State<Arc<Server>>,
    Path(id): Path<Uuid>,
) -> Response {
    match server.incidents.find(id).await {
        Some(incident) => Json(incident).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "incident not found"})),
        )
            .into_response(),
    }
}

pub async fn metrics() -> Response {
    gather_metrics().into_response()
}
