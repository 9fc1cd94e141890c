//! Language-model providers that stream answer fragments.
pub mod ollama;
pub mod scripted;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub use ollama::OllamaModel;
pub use scripted::ScriptedModel;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("could not reach language model: {0}")]
    Connection(String),

    #[error("language model timed out")]
    Timeout,

    #[error("language model returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("malformed stream from language model: {0}")]
    Protocol(String),
}

/// Answer fragments in generation order. Ends after the last fragment or
/// the first error.
pub type TokenStream = BoxStream<'static, Result<String, GenerationError>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Start generating a completion for `prompt`.
    ///
    /// Errors raised before the first fragment are returned directly; later
    /// ones arrive through the stream.
    async fn complete_stream(&self, prompt: &str) -> Result<TokenStream, GenerationError>;
}
