//! Error taxonomy for reductions, the entry store and the LLM transport.
//!
//! [`ReductionError`] is returned by every reduction entry point. Some of
//! its variants are expected outcomes rather than failures: see
//! [`ReductionError::is_expected`].

use thiserror::Error;

/// Why a compaction or branch-summary attempt did not append an entry.
#[derive(Debug, Error)]
pub enum ReductionError {
    /// The branch is already reduced, or there is nothing worth summarizing.
    #[error("nothing to compact")]
    NothingToCompact,

    /// Cooperative cancellation was observed before or after a model call.
    #[error("reduction cancelled")]
    Cancelled,

    /// The model returned an error stop reason or the transport failed.
    #[error("summarization failed: {0}")]
    SummarizationFailed(String),

    /// An override hook declined the reduction.
    #[error("reduction vetoed{}", .reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Vetoed { reason: Option<String> },

    /// Another reduction is already running for this session.
    #[error("a reduction is already in progress")]
    InProgress,

    /// The log moved under the plan while the summary was being generated.
    #[error("stale reduction plan: {0}")]
    StalePlan(String),

    #[error("entry not found: {0}")]
    EntryNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReductionError {
    /// Outcomes a caller should surface as a no-op rather than an error.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ReductionError::NothingToCompact
                | ReductionError::Vetoed { .. }
                | ReductionError::Cancelled
                | ReductionError::InProgress
        )
    }
}

/// Failures of the session log.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed session log entry on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize session log entry: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("duplicate entry id: {0}")]
    DuplicateId(String),

    #[error("entry {id} references unknown parent {parent}")]
    UnknownParent { id: String, parent: String },

    #[error("entry not found: {0}")]
    UnknownEntry(String),
}

/// Failures of an [`LlmTransport`](crate::api::LlmTransport) call.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(String),

    #[error("API HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("API error: {0}")]
    Api(String),

    #[error("failed to parse response: {0}")]
    Parse(String),
}

/// Failures loading a JSON configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid settings in {path}: {reason}")]
    Invalid { path: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_outcomes_are_flagged() {
        assert!(ReductionError::NothingToCompact.is_expected());
        assert!(ReductionError::Cancelled.is_expected());
        assert!(ReductionError::Vetoed { reason: None }.is_expected());
        assert!(!ReductionError::SummarizationFailed("boom".into()).is_expected());
        assert!(!ReductionError::StalePlan("moved".into()).is_expected());
    }

    #[test]
    fn veto_message_includes_reason() {
        let err = ReductionError::Vetoed {
            reason: Some("busy".into()),
        };
        assert_eq!(err.to_string(), "reduction vetoed: busy");
        let err = ReductionError::Vetoed { reason: None };
        assert_eq!(err.to_string(), "reduction vetoed");
    }
}
