//! Error types shared across the sink pipeline.

use thiserror::Error;

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, SinkError>;

/// Failure returned by a store session when a transaction attempt does not
/// commit cleanly.
///
/// At-least-once semantics mean an ambiguous failure may still have applied;
/// the sink never reconciles, it only decides whether to propagate or to
/// degrade to per-group submission.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("store write failed (retryable={retryable}): {message}")]
pub struct WriteFailure {
    /// Store-reported failure text.
    pub message: String,
    /// Whether the store classified the failure as retryable.
    pub retryable: bool,
}

impl WriteFailure {
    pub fn new(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            message: message.into(),
            retryable,
        }
    }
}

/// Returns `true` when `message` encodes a duplicate-key violation.
///
/// Retried non-idempotent writes can trip this even though the original
/// attempt applied; callers use it to annotate diagnostics, never to drop
/// the failure.
pub fn is_duplicate_key_violation_message(message: &str) -> bool {
    message.contains("duplicate key value violates unique constraint")
}

/// Unified error type for the sink pipeline.
#[derive(Debug, Error)]
pub enum SinkError {
    /// A mutation referenced a table or column absent from the schema
    /// snapshot, or disagreed with its declared shape. Fatal for the run.
    #[error("schema mismatch for table '{table}': {detail}")]
    SchemaMismatch {
        /// Normalized table name the mutation addressed.
        table: String,
        /// What disagreed with the snapshot.
        detail: String,
    },

    /// Serialized mutation bytes could not be decoded. Fatal for the run.
    #[error("corrupt mutation encoding: {0}")]
    Encoding(String),

    /// A transaction attempt against the store failed. Fatal under
    /// `FailureMode::FailFast`; downgraded to per-group reporting under
    /// `FailureMode::ReportFailures`.
    #[error(transparent)]
    Write(#[from] WriteFailure),

    /// Invalid sink configuration, rejected at construction.
    #[error("invalid sink configuration: {0}")]
    Config(String),

    /// A pipeline task terminated abnormally (panic or cancellation).
    #[error("pipeline task failed: {0}")]
    Task(String),
}

impl SinkError {
    /// Builds a schema-mismatch error for `table`.
    pub(crate) fn schema_mismatch(table: &str, detail: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            table: table.to_string(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_key_classifier_matches_store_message() {
        assert!(is_duplicate_key_violation_message(
            "duplicate key value violates unique constraint 'orders_pkey'"
        ));
        assert!(!is_duplicate_key_violation_message("deadline exceeded"));
    }

    #[test]
    fn write_failure_display_carries_retryability() {
        let err = WriteFailure::new("shard unavailable", true);
        let rendered = err.to_string();
        assert!(rendered.contains("retryable=true"));
        assert!(rendered.contains("shard unavailable"));
    }
}
