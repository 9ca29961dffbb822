use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub reasoning: ReasoningConfig,
    pub context: ContextConfig,
    pub workflow: WorkflowConfig,
    pub breaker: BreakerConfig,
    pub database: DatabaseConfig,
    pub escalation: EscalationConfig,
    /// The orchestrator's own service name. Alerts for this target are
    /// dropped at ingestion so the orchestrator can never try to recover
    /// itself.
    pub self_identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub url: String,
    pub source_id: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Template for per-service health probes, `{target}` is substituted.
    pub health_url_template: String,
    pub prometheus_url: String,
    pub loki_url: String,
    pub provider_timeout_secs: u64,
    /// Static service dependency map, "svc-a:db,cache;svc-b:db" in env form.
    pub topology: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub default_step_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub sqlite_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    pub webhook_url: Option<String>,
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Config {
            server: ServerConfig {
                addr: env_or("SERVER_ADDR", "0.0.0.0:8080"),
            },
            gateway: GatewayConfig {
                url: env_or("GATEWAY_URL", ""),
                source_id: env_or("GATEWAY_SOURCE_ID", "remedy-orchestrator"),
                timeout_secs: env_parse("GATEWAY_TIMEOUT_SECS", 30),
            },
            reasoning: ReasoningConfig {
                url: env_or("REASONING_URL", "https://api.openai.com"),
                api_key: env_or("REASONING_API_KEY", ""),
                model: env_or("REASONING_MODEL", "gpt-4o"),
                timeout_secs: env_parse("REASONING_TIMEOUT_SECS", 60),
                max_tokens: env_parse("REASONING_MAX_TOKENS", 4000),
            },
            context: ContextConfig {
                health_url_template: env_or(
                    "CONTEXT_HEALTH_URL_TEMPLATE",
                    "http://{target}:8080/health",
                ),
                prometheus_url: env_or("CONTEXT_PROMETHEUS_URL", "http://prometheus:9090"),
                loki_url: env_or("CONTEXT_LOKI_URL", "http://loki:3100"),
                provider_timeout_secs: env_parse("CONTEXT_PROVIDER_TIMEOUT_SECS", 10),
                topology: parse_topology(&env_or("CONTEXT_TOPOLOGY", "")),
            },
            workflow: WorkflowConfig {
                max_retries: env_parse("WORKFLOW_MAX_RETRIES", 2),
                backoff_base_ms: env_parse("WORKFLOW_BACKOFF_BASE_MS", 500),
                default_step_timeout_secs: env_parse("WORKFLOW_STEP_TIMEOUT_SECS", 60),
            },
            breaker: BreakerConfig {
                failure_threshold: env_parse("BREAKER_FAILURE_THRESHOLD", 3),
                cooldown_secs: env_parse("BREAKER_COOLDOWN_SECS", 300),
            },
            database: DatabaseConfig {
                sqlite_path: std::env::var("SQLITE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("data/remedy.db")),
            },
            escalation: EscalationConfig {
                webhook_url: std::env::var("ESCALATION_WEBHOOK_URL").ok(),
            },
            self_identity: env_or("SELF_IDENTITY", "remedy-orchestrator"),
        };

        if config.gateway.url.is_empty() {
            return Err(crate::Error::Config(
                "GATEWAY_URL must be set; the orchestrator has no local execution path".to_string(),
            ));
        }
        if config.reasoning.api_key.is_empty() {
            tracing::warn!("REASONING_API_KEY is not set; every plan will fall back to escalation");
        }
        if config.self_identity.is_empty() {
            return Err(crate::Error::Config(
                "SELF_IDENTITY must not be empty".to_string(),
            ));
        }

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:8080".to_string(),
            },
            gateway: GatewayConfig {
                url: "http://gateway:8003".to_string(),
                source_id: "remedy-orchestrator".to_string(),
                timeout_secs: 30,
            },
            reasoning: ReasoningConfig {
                url: "https://api.openai.com".to_string(),
                api_key: "".to_string(),
                model: "gpt-4o".to_string(),
                timeout_secs: 60,
                max_tokens: 4000,
            },
            context: ContextConfig {
                health_url_template: "http://{target}:8080/health".to_string(),
                prometheus_url: "http://prometheus:9090".to_string(),
                loki_url: "http://loki:3100".to_string(),
                provider_timeout_secs: 10,
                topology: HashMap::new(),
            },
            workflow: WorkflowConfig {
                max_retries: 2,
                backoff_base_ms: 500,
                default_step_timeout_secs: 60,
            },
            breaker: BreakerConfig {
                failure_threshold: 3,
                cooldown_secs: 300,
            },
            database: DatabaseConfig {
                sqlite_path: PathBuf::from("data/remedy.db"),
            },
            escalation: EscalationConfig { webhook_url: None },
            self_identity: "remedy-orchestrator".to_string(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Parses "svc-a:db,cache;svc-b:db" into a dependency map.
fn parse_topology(raw: &str) -> HashMap<String, Vec<String>> {
    let mut map = HashMap::new();
    for entry in raw.split(';').filter(|e| !e.trim().is_empty()) {
        if let Some((service, deps)) = entry.split_once(':') {
            let deps = deps
                .split(',')
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect();
            map.insert(service.trim().to_string(), deps);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_topology_entries() {
        let map = parse_topology("svc-a:db,cache;svc-b:db");
        assert_eq!(map["svc-a"], vec!["db", "cache"]);
        assert_eq!(map["svc-b"], vec!["db"]);
    }

    #[test]
    fn empty_topology_yields_empty_map() {
        assert!(parse_topology("").is_empty());
        assert!(parse_topology(" ; ").is_empty());
    }
}
