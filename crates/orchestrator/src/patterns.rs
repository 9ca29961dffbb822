//! Append-only log of past incident outcomes, queried by context similarity.
//! Injected behind a trait so tests can substitute the in-memory fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::alert::Alert;
use crate::Result;

/// One closed incident, recorded once at closure and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRecord {
    pub id: Uuid,
    pub target: String,
    pub alert_name: String,
    /// Context fingerprint as a normalized token set.
    pub tokens: BTreeSet<String>,
    /// Operation names the plan executed, in order.
    pub plan_summary: Vec<String>,
    /// Terminal incident status: resolved | escalated | aborted.
    pub outcome: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ScoredPattern {
    pub score: f64,
    pub record: PatternRecord,
}

#[async_trait]
pub trait PatternStore: Send + Sync {
    async fn append(&self, record: PatternRecord) -> Result<()>;
    /// Returns up to `k` past records ranked by similarity to `tokens`,
    /// most recent first among equally-scored entries.
    async fn query(&self, tokens: &BTreeSet<String>, k: usize) -> Result<Vec<ScoredPattern>>;
}

/// Derives the similarity fingerprint for an alert: lowercase alphanumeric
/// tokens from the target, alert name and description.
pub fn fingerprint_tokens(alert: &Alert) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    for field in [&alert.target, &alert.alert_name, &alert.description] {
        for token in field
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| t.len() > 2)
        {
            tokens.insert(token.to_lowercase());
        }
    }
    tokens.insert(alert.target.to_lowercase());
    tokens
}

/// Compact hex form of a fingerprint, for logging and record correlation.
pub fn fingerprint_hex(tokens: &BTreeSet<String>) -> String {
    let mut hasher = Sha256::new();
    for token in tokens {
        hasher.update(token.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

fn rank(records: Vec<PatternRecord>, tokens: &BTreeSet<String>, k: usize) -> Vec<ScoredPattern> {
    let mut scored: Vec<ScoredPattern> = records
        .into_iter()
        .map(|record| ScoredPattern {
            score: jaccard(tokens, &record.tokens),
            record,
        })
        .filter(|s| s.score > 0.0)
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.record.created_at.cmp(&a.record.created_at))
    });
    scored.truncate(k);
    scored
}

// --- sqlite-backed store ---------------------------------------------------

pub struct SqlitePatternStore {
    pool: SqlitePool,
}

impl SqlitePatternStore {
    pub async fn new(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        info!("Connecting to pattern store: {}", url);
        let pool = SqlitePool::connect(&url).await?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pattern_records (
                id TEXT PRIMARY KEY,
                target TEXT NOT NULL,
                alert_name TEXT NOT NULL,
                tokens TEXT NOT NULL,
                plan_summary TEXT NOT NULL,
                outcome TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PatternStore for SqlitePatternStore {
    async fn append(&self, record: PatternRecord) -> Result<()> {
        debug!(
            target = %record.target,
            outcome = %record.outcome,
            fingerprint = %fingerprint_hex(&record.tokens),
            "Appending pattern record"
        );
        sqlx::query(
            r#"
            INSERT INTO pattern_records
                (id, target, alert_name, tokens, plan_summary, outcome, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.target)
        .bind(&record.alert_name)
        .bind(serde_json::to_string(&record.tokens)?)
        .bind(serde_json::to_string(&record.plan_summary)?)
        .bind(&record.outcome)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query(&self, tokens: &BTreeSet<String>, k: usize) -> Result<Vec<ScoredPattern>> {
        // Similarity is computed in-process over a bounded window of the
        // most recent records.
        let rows = sqlx::query(
            "SELECT id, target, alert_name, tokens, plan_summary, outcome, created_at \
             FROM pattern_records ORDER BY created_at DESC LIMIT 500",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let created_at: String = row.try_get("created_at")?;
            records.push(PatternRecord {
                id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
                target: row.try_get("target")?,
                alert_name: row.try_get("alert_name")?,
                tokens: serde_json::from_str(row.try_get::<String, _>("tokens")?.as_str())?,
                plan_summary: serde_json::from_str(
                    row.try_get::<String, _>("plan_summary")?.as_str(),
                )?,
                outcome: row.try_get("outcome")?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(rank(records, tokens, k))
    }
}

// --- in-memory store (tests, single-node dev) -------------------------------

#[derive(Default)]
pub struct MemoryPatternStore {
    records: Mutex<Vec<PatternRecord>>,
}

impl MemoryPatternStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PatternStore for MemoryPatternStore {
    async fn append(&self, record: PatternRecord) -> Result<()> {
        self.records
            .lock()
            .expect("pattern store lock poisoned")
            .push(record);
        Ok(())
    }

    async fn query(&self, tokens: &BTreeSet<String>, k: usize) -> Result<Vec<ScoredPattern>> {
        let records = self
            .records
            .lock()
            .expect("pattern store lock poisoned")
            .clone();
        Ok(rank(records, tokens, k))
    }
}
