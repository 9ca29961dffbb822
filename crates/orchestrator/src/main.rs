use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use remedy_orchestrator::{
    breaker::CircuitBreaker,
    config::Config,
    context::{
        ContextBuilder, ContextProvider, HealthProbeProvider, HistoryProvider, LogTailProvider,
        PrometheusResourceProvider, TopologyProvider,
    },
    escalate::{EscalationNotifier, StdoutNotifier, WebhookNotifier},
    gateway::HttpGatewayClient,
    ingest::{AlertIngestor, IncidentRegistry},
    metrics::register_metrics,
    operations::OperationTranslator,
    patterns::{PatternStore, SqlitePatternStore},
    planner::{DiagnosticPlanner, OpenAiReasoningClient},
    server::Server,
    workflow::{IncidentLog, WorkflowEngine},
    Result,
};

const SIMILAR_INCIDENTS_TOP_K: usize = 5;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::load()?;
    info!("Loaded configuration for {}", config.self_identity);

    register_metrics();

    // Pattern store
    let store = SqlitePatternStore::new(&config.database.sqlite_path).await?;
    store.init().await?;
    let patterns: Arc<dyn PatternStore> = Arc::new(store);

    // Context providers
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.context.provider_timeout_secs))
        .build()
        .map_err(|e| {
            remedy_orchestrator::Error::Config(format!("failed to build context client: {e}"))
        })?;
    let providers: Vec<Arc<dyn ContextProvider>> = vec![
        Arc::new(HealthProbeProvider::new(
            http.clone(),
            &config.context.health_url_template,
        )),
        Arc::new(PrometheusResourceProvider::new(
            http.clone(),
            &config.context.prometheus_url,
        )),
        Arc::new(LogTailProvider::new(http.clone(), &config.context.loki_url)),
        Arc::new(TopologyProvider::new(config.context.topology.clone())),
        Arc::new(HistoryProvider::new(
            patterns.clone(),
            SIMILAR_INCIDENTS_TOP_K,
        )),
    ];
    let context_builder = ContextBuilder::new(
        providers,
        Duration::from_secs(config.context.provider_timeout_secs),
    );

    // Planner
    let reasoning = Arc::new(OpenAiReasoningClient::new(
        &config.reasoning.url,
        &config.reasoning.api_key,
        &config.reasoning.model,
        config.reasoning.max_tokens,
        Duration::from_secs(config.reasoning.timeout_secs),
    )?);
    let planner = DiagnosticPlanner::new(
        reasoning,
        patterns.clone(),
        SIMILAR_INCIDENTS_TOP_K,
        config.workflow.default_step_timeout_secs,
    );

    // Execution path
    let gateway = Arc::new(HttpGatewayClient::new(
        &config.gateway.url,
        Duration::from_secs(config.gateway.timeout_secs),
    )?);
    let translator = OperationTranslator::new(&config.gateway.source_id);
    let breaker = Arc::new(CircuitBreaker::new(
        config.breaker.failure_threshold,
        Duration::from_secs(config.breaker.cooldown_secs),
    ));

    let notifier: Arc<dyn EscalationNotifier> = match &config.escalation.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url)?),
        None => Arc::new(StdoutNotifier),
    };

    let registry = Arc::new(IncidentRegistry::new());
    let incidents = Arc::new(IncidentLog::new());
    let engine = Arc::new(WorkflowEngine::new(
        gateway,
        planner,
        translator,
        context_builder,
        breaker,
        patterns,
        notifier,
        registry.clone(),
        incidents.clone(),
        config.workflow.clone(),
    ));

    let ingestor = Arc::new(AlertIngestor::new(
        registry,
        engine,
        &config.self_identity,
    ));

    let app = Server::new(ingestor, incidents).build_router();
    info!("Starting server on {}", config.server.addr);
    let listener = tokio::net::TcpListener::bind(&config.server.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
