pub mod alert;
pub mod breaker;
pub mod config;
pub mod context;
pub mod escalate;
pub mod gateway;
pub mod ingest;
pub mod metrics;
pub mod operations;
pub mod patterns;
pub mod planner;
pub mod server;
pub mod workflow;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("transient execution error: {0}")]
    TransientExecution(String),
    #[error("permanent execution error: {0}")]
    PermanentExecution(String),
    #[error("reasoning service error: {0}")]
    ReasoningService(String),
    #[error("circuit open for target: {0}")]
    CircuitOpen(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures worth another attempt under the bounded retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientExecution(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Truncates in place to at most `max_bytes`, backing the cut up to a
/// character boundary so multi-byte text never splits mid-character.
pub fn truncate_to_boundary(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_lands_on_char_boundaries() {
        for max in 0..12 {
            let mut s = "héllo wörld".to_string();
            truncate_to_boundary(&mut s, max);
            assert!(s.len() <= max);
        }

        let mut s = "é".repeat(100);
        truncate_to_boundary(&mut s, 101);
        assert_eq!(s.len(), 100);

        let mut short = "abc".to_string();
        truncate_to_boundary(&mut short, 10);
        assert_eq!(short, "abc");
    }
}
