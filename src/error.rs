//! Crate-wide error type.
use thiserror::Error;

use crate::embedder::EmbedderError;
use crate::indexer::extract::ExtractError;
use crate::llm::GenerationError;

/// Errors surfaced by the registry, index, pipeline, retriever and session store.
#[derive(Error, Debug)]
pub enum RagError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Text extraction failed for a single document. Recorded on the
    /// document, never aborts an ingestion batch.
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),

    /// Embedding provider or storage unavailable.
    #[error("index failure: {0}")]
    Index(String),

    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RagError {
    /// Stable machine-readable code used in API error bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::InvalidInput(_) | Self::Extraction(_) => "bad_request",
            Self::Index(_) | Self::Generation(_) => "index_failure",
            Self::Io(_) | Self::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for RagError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Index(format!("storage: {e}"))
    }
}

impl From<EmbedderError> for RagError {
    fn from(e: EmbedderError) -> Self {
        Self::Index(format!("embedding: {e}"))
    }
}

impl From<tokio::task::JoinError> for RagError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("background task failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(RagError::NotFound("x".into()).code(), "not_found");
        assert_eq!(RagError::Conflict("x".into()).code(), "conflict");
        assert_eq!(RagError::InvalidInput("x".into()).code(), "bad_request");
        assert_eq!(RagError::Index("x".into()).code(), "index_failure");
        assert_eq!(RagError::Internal("x".into()).code(), "internal");
    }

    #[test]
    fn test_storage_errors_become_index_failures() {
        let err: RagError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, RagError::Index(_)));
        assert!(err.to_string().contains("storage"));
    }
}
