//! Situational context assembly. Each provider is queried independently
//! with its own timeout; a failing provider degrades its section to an
//! explicit "unavailable" marker instead of aborting the build, so the
//! resulting snapshot always has the same shape.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::patterns::{PatternStore, ScoredPattern};
use crate::Result;

pub const SECTION_HEALTH: &str = "health";
pub const SECTION_RESOURCES: &str = "resources";
pub const SECTION_LOGS: &str = "recent_logs";
pub const SECTION_TOPOLOGY: &str = "topology";
pub const SECTION_HISTORY: &str = "incident_history";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    pub available: bool,
    pub data: Value,
}

impl ContextSection {
    pub fn ok(data: Value) -> Self {
        Self {
            available: true,
            data,
        }
    }

    pub fn unavailable(reason: &str) -> Self {
        Self {
            available: false,
            data: json!({ "reason": reason }),
        }
    }
}

/// One incident context snapshot. Downstream consumers can rely on every
/// provider's section being present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub target: String,
    pub gathered_at: DateTime<Utc>,
    pub sections: BTreeMap<String, ContextSection>,
    /// Summaries of alerts coalesced into the incident after creation.
    pub coalesced_alerts: Vec<String>,
}

impl Context {
    pub fn empty(target: &str) -> Self {
        Self {
            target: target.to_string(),
            gathered_at: Utc::now(),
            sections: BTreeMap::new(),
            coalesced_alerts: Vec::new(),
        }
    }

    pub fn note_coalesced(&mut self, summary: String) {
        self.coalesced_alerts.push(summary);
    }

    /// Compact JSON rendering for the reasoning prompt, bounded in size.
    pub fn summary_for_prompt(&self, max_chars: usize) -> String {
        let mut rendered =
            serde_json::to_string(&self.sections).unwrap_or_else(|_| "{}".to_string());
        if rendered.len() > max_chars {
            crate::truncate_to_boundary(&mut rendered, max_chars);
            rendered.push_str("...\"}");
        }
        rendered
    }
}

#[async_trait]
pub trait ContextProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn query(&self, target: &str) -> Result<Value>;
}

pub struct ContextBuilder {
    providers: Vec<Arc<dyn ContextProvider>>,
    timeout: Duration,
}

impl ContextBuilder {
    pub fn new(providers: Vec<Arc<dyn ContextProvider>>, timeout: Duration) -> Self {
        Self { providers, timeout }
    }

    pub async fn gather(&self, target: &str) -> Context {
        let queries = self.providers.iter().map(|provider| {
            let provider = provider.clone();
            let target = target.to_string();
            let timeout = self.timeout;
            async move {
                let name = provider.name();
                let section = match tokio::time::timeout(timeout, provider.query(&target)).await {
                    Ok(Ok(data)) => ContextSection::ok(data),
                    Ok(Err(e)) => {
                        warn!(provider = name, target = %target, error = %e, "Context provider failed");
                        ContextSection::unavailable(&e.to_string())
                    }
                    Err(_) => {
                        warn!(provider = name, target = %target, "Context provider timed out");
                        ContextSection::unavailable("provider timed out")
                    }
                };
                (name, section)
            }
        });

        let mut context = Context::empty(target);
        for (name, section) in join_all(queries).await {
            context.sections.insert(name.to_string(), section);
        }
        debug!(
            target,
            sections = context.sections.len(),
            "Context gathering complete"
        );
        context
    }
}

// --- concrete providers ------------------------------------------------------

/// Probes the service's own health endpoint.
pub struct HealthProbeProvider {
    client: Client,
    url_template: String,
}

impl HealthProbeProvider {
    pub fn new(client: Client, url_template: &str) -> Self {
        Self {
            client,
            url_template: url_template.to_string(),
        }
    }
}

#[async_trait]
impl ContextProvider for HealthProbeProvider {
    fn name(&self) -> &'static str {
        SECTION_HEALTH
    }

    async fn query(&self, target: &str) -> Result<Value> {
        let url = self.url_template.replace("{target}", target);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| crate::Error::TransientExecution(format!("health probe failed: {e}")))?;
        let status = response.status().as_u16();
        let mut body = response.text().await.unwrap_or_default();
        crate::truncate_to_boundary(&mut body, 512);
        Ok(json!({
            "status_code": status,
            "healthy": (200..300).contains(&status),
            "body": body,
        }))
    }
}

/// Instant resource metrics from a Prometheus-compatible endpoint.
pub struct PrometheusResourceProvider {
    client: Client,
    base_url: String,
}

impl PrometheusResourceProvider {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn instant_query(&self, query: &str) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| crate::Error::TransientExecution(format!("metrics query failed: {e}")))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| crate::Error::Internal(format!("metrics response parse error: {e}")))?;
        Ok(body.get("data").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ContextProvider for PrometheusResourceProvider {
    fn name(&self) -> &'static str {
        SECTION_RESOURCES
    }

    async fn query(&self, target: &str) -> Result<Value> {
        let cpu = self
            .instant_query(&format!(
                "rate(process_cpu_seconds_total{{job=\"{target}\"}}[5m])"
            ))
            .await?;
        let memory = self
            .instant_query(&format!("process_resident_memory_bytes{{job=\"{target}\"}}"))
            .await?;
        Ok(json!({ "cpu": cpu, "memory": memory }))
    }
}

/// Recent log lines from a Loki-compatible endpoint.
pub struct LogTailProvider {
    client: Client,
    base_url: String,
    limit: u32,
}

impl LogTailProvider {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            limit: 100,
        }
    }
}

#[async_trait]
impl ContextProvider for LogTailProvider {
    fn name(&self) -> &'static str {
        SECTION_LOGS
    }

    async fn query(&self, target: &str) -> Result<Value> {
        let response = self
            .client
            .get(format!("{}/loki/api/v1/query_range", self.base_url))
            .query(&[
                ("query", format!("{{job=\"{target}\"}}")),
                ("limit", self.limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| crate::Error::TransientExecution(format!("log query failed: {e}")))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| crate::Error::Internal(format!("log response parse error: {e}")))?;
        Ok(body
            .get("data")
            .and_then(|d| d.get("result"))
            .cloned()
            .unwrap_or(Value::Null))
    }
}

/// Static service dependency map declared in configuration.
pub struct TopologyProvider {
    topology: HashMap<String, Vec<String>>,
}

impl TopologyProvider {
    pub fn new(topology: HashMap<String, Vec<String>>) -> Self {
        Self { topology }
    }
}

#[async_trait]
impl ContextProvider for TopologyProvider {
    fn name(&self) -> &'static str {
        SECTION_TOPOLOGY
    }

    async fn query(&self, target: &str) -> Result<Value> {
        let dependencies = self.topology.get(target).cloned().unwrap_or_default();
        let dependents: Vec<&String> = self
            .topology
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d == target))
            .map(|(service, _)| service)
            .collect();
        Ok(json!({ "dependencies": dependencies, "dependents": dependents }))
    }
}

/// Recent similar incidents from the pattern store's read side.
pub struct HistoryProvider {
    patterns: Arc<dyn PatternStore>,
    top_k: usize,
}

impl HistoryProvider {
    pub fn new(patterns: Arc<dyn PatternStore>, top_k: usize) -> Self {
        Self { patterns, top_k }
    }
}

#[async_trait]
impl ContextProvider for HistoryProvider {
    fn name(&self) -> &'static str {
        SECTION_HISTORY
    }

    async fn query(&self, target: &str) -> Result<Value> {
        let tokens = std::iter::once(target.to_lowercase()).collect();
        let similar = self.patterns.query(&tokens, self.top_k).await?;
        let entries: Vec<Value> = similar
            .iter()
            .map(|ScoredPattern { score, record }| {
                json!({
                    "alert": record.alert_name,
                    "outcome": record.outcome,
                    "operations": record.plan_summary,
                    "similarity": score,
                    "closed_at": record.created_at,
                })
            })
            .collect();
        Ok(Value::Array(entries))
    }
}
