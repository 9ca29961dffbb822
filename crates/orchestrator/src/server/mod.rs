//! HTTP surface: alert webhook, incident inspection, health and metrics.

mod routes;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::ingest::AlertIngestor;
use crate::workflow::IncidentLog;

pub struct Server {
    ingestor: Arc<AlertIngestor>,
    incidents: Arc<IncidentLog>,
}

impl Server {
    pub fn new(ingestor: Arc<AlertIngestor>, incidents: Arc<IncidentLog>) -> Self {
        Self {
            ingestor,
            incidents,
        }
    }

    pub fn build_router(self) -> Router {
        let state = Arc::new(self);

        Router::new()
            .route("/health", get(routes::health))
            .route("/webhook/alerts", post(routes::webhook_alerts))
            .route("/incidents", get(routes::list_incidents))
            .route("/incidents/{id}", get(routes::get_incident))
            .route("/metrics", get(routes::metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}
