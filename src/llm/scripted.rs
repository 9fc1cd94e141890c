/// Scripted language model.
///
/// Streams a fixed list of fragments, optionally failing up front or after
/// a number of fragments, and records every prompt it receives. Selected
/// with `llm.provider = "scripted"` for offline runs, where it answers every
/// question with `llm.scripted_response`.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, stream};

use super::{GenerationError, LanguageModel, TokenStream};
use crate::config::LlmConfig;

#[derive(Default)]
pub struct ScriptedModel {
    fragments: Vec<String>,
    refuse: Option<GenerationError>,
    fail_after: Option<(usize, GenerationError)>,
    delay: Option<Duration>,
    served: Arc<AtomicUsize>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    #[must_use]
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Answer with `config.scripted_response`, streamed word by word.
    #[must_use]
    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(config.scripted_response.split_inclusive(' '))
    }

    /// Fail the request before any fragment is produced.
    #[must_use]
    pub fn refusing(error: GenerationError) -> Self {
        Self {
            refuse: Some(error),
            ..Self::default()
        }
    }

    /// Emit `count` fragments, then `error`.
    #[must_use]
    pub fn failing_after(mut self, count: usize, error: GenerationError) -> Self {
        self.fail_after = Some((count, error));
        self
    }

    /// Sleep before each fragment.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fragments handed out so far, across all requests.
    #[must_use]
    pub fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete_stream(&self, prompt: &str) -> Result<TokenStream, GenerationError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        if let Some(error) = &self.refuse {
            return Err(error.clone());
        }

        let mut items: Vec<Result<String, GenerationError>> = match &self.fail_after {
            Some((count, _)) => self.fragments.iter().take(*count).cloned().map(Ok).collect(),
            None => self.fragments.iter().cloned().map(Ok).collect(),
        };
        if let Some((_, error)) = &self.fail_after {
            items.push(Err(error.clone()));
        }

        let served = self.served.clone();
        let delay = self.delay;
        Ok(stream::iter(items)
            .then(move |item| {
                let served = served.clone();
                async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    served.fetch_add(1, Ordering::SeqCst);
                    item
                }
            })
            .boxed())
    }
}
