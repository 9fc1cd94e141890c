/// Embedder trait and shared types for text embedding.
pub mod hashing;
pub mod ollama;

use std::sync::Arc;

use thiserror::Error;

use crate::config::EmbeddingConfig;

/// Errors that can occur during embedding operations.
#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Trait for text embedding implementations.
///
/// All implementations must be `Send + Sync` to allow concurrent use
/// behind `Arc`. Calls may block; async callers go through
/// `spawn_blocking`.
pub trait Embedder: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError>;

    /// Embed multiple text strings into vectors.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError>;

    /// Return the dimensionality of the embedding vectors.
    fn dimensions(&self) -> usize;

    /// Identifier recorded in every index built with this embedder.
    fn model_id(&self) -> String;
}

/// Build the embedder selected by `config.provider`.
///
/// The Ollama embedder needs a running tokio runtime.
pub fn from_config(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, EmbedderError> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(hashing::HashingEmbedder::new(config.dimensions))),
        "ollama" => Ok(Arc::new(ollama::OllamaEmbedder::new(config)?)),
        other => Err(EmbedderError::Unavailable(format!(
            "unknown embedding provider '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_hashing() {
        let config = EmbeddingConfig {
            dimensions: 64,
            ..EmbeddingConfig::default()
        };
        let embedder = from_config(&config).unwrap();
        assert_eq!(embedder.dimensions(), 64);
        assert_eq!(embedder.model_id(), "hashing-v1-64");
    }

    #[test]
    fn test_from_config_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "word2vec".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(matches!(
            from_config(&config),
            Err(EmbedderError::Unavailable(_))
        ));
    }
}
