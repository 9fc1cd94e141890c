//! Streaming answer generation.
//!
//! [`AnswerGenerator::generate`] spawns a producer task and hands back an
//! [`AnswerStream`]. The stream yields exactly one `Metadata` event, then
//! `Content` fragments, then exactly one terminal `Done` or `Error`.
//! Cancelling or dropping the stream stops the producer.
pub mod prompt;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::db::models::{Message, SourceCitation};
use crate::index::Passage;
use crate::llm::LanguageModel;

/// Shown to the user in place of an answer when generation fails.
pub const FALLBACK_ANSWER: &str =
    "I'm sorry, I couldn't generate a response due to an internal error.";

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerEvent {
    Metadata { sources: Vec<SourceCitation> },
    Content { content: String },
    Done,
    Error { content: String },
}

impl AnswerEvent {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }

    fn failure() -> Self {
        Self::Error {
            content: FALLBACK_ANSWER.to_string(),
        }
    }
}

/// A fully drained stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub sources: Vec<SourceCitation>,
    pub text: String,
    /// The fallback message when generation failed.
    pub error: Option<String>,
}

pub struct AnswerGenerator {
    llm: Arc<dyn LanguageModel>,
    history_turns: usize,
}

impl AnswerGenerator {
    pub fn new(llm: Arc<dyn LanguageModel>, history_turns: usize) -> Self {
        Self { llm, history_turns }
    }

    /// Start answering `query` from `passages`. Must be called inside a
    /// tokio runtime.
    pub fn generate(
        &self,
        client_id: &str,
        query: &str,
        passages: &[Passage],
        history: &[Message],
    ) -> AnswerStream {
        let prompt = prompt::build_prompt(client_id, query, passages, history, self.history_turns);
        let sources: Vec<SourceCitation> = passages.iter().map(Passage::citation).collect();

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(produce(
            self.llm.clone(),
            prompt,
            sources,
            tx,
            cancel.clone(),
        ));

        AnswerStream {
            rx,
            cancel,
            terminated: false,
        }
    }
}

/// Send `event` unless the consumer is gone or the stream was cancelled.
async fn emit(tx: &mpsc::Sender<AnswerEvent>, cancel: &CancellationToken, event: AnswerEvent) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

async fn produce(
    llm: Arc<dyn LanguageModel>,
    prompt: String,
    sources: Vec<SourceCitation>,
    tx: mpsc::Sender<AnswerEvent>,
    cancel: CancellationToken,
) {
    if !emit(&tx, &cancel, AnswerEvent::Metadata { sources }).await {
        return;
    }

    let started = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        started = llm.complete_stream(&prompt) => started,
    };
    let mut tokens = match started {
        Ok(tokens) => tokens,
        Err(e) => {
            error!("Language model request failed: {e}");
            emit(&tx, &cancel, AnswerEvent::failure()).await;
            return;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("Answer generation cancelled");
                return;
            }
            next = tokens.next() => next,
        };

        match next {
            Some(Ok(fragment)) => {
                if fragment.is_empty() {
                    continue;
                }
                if !emit(&tx, &cancel, AnswerEvent::Content { content: fragment }).await {
                    return;
                }
            }
            Some(Err(e)) => {
                error!("Language model stream failed: {e}");
                emit(&tx, &cancel, AnswerEvent::failure()).await;
                return;
            }
            None => {
                emit(&tx, &cancel, AnswerEvent::Done).await;
                return;
            }
        }
    }
}

/// Consumer side of one answer.
///
/// Yields no further events after a terminal one or after [`cancel`].
///
/// [`cancel`]: AnswerStream::cancel
pub struct AnswerStream {
    rx: mpsc::Receiver<AnswerEvent>,
    cancel: CancellationToken,
    terminated: bool,
}

impl AnswerStream {
    /// Stop generation. The stream ends immediately.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        self.terminated = true;
    }

    /// Token that fires when this stream is cancelled or dropped.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain the stream into a single answer.
    pub async fn collect_answer(mut self) -> Answer {
        let mut answer = Answer {
            sources: Vec::new(),
            text: String::new(),
            error: None,
        };
        while let Some(event) = self.next().await {
            match event {
                AnswerEvent::Metadata { sources } => answer.sources = sources,
                AnswerEvent::Content { content } => answer.text.push_str(&content),
                AnswerEvent::Done => {}
                AnswerEvent::Error { content } => answer.error = Some(content),
            }
        }
        answer
    }
}

impl Stream for AnswerStream {
    type Item = AnswerEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<AnswerEvent>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    this.terminated = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                // Producer vanished without a terminal event (panicked task)
                this.terminated = true;
                if this.cancel.is_cancelled() {
                    Poll::Ready(None)
                } else {
                    warn!("Answer producer stopped without a terminal event");
                    Poll::Ready(Some(AnswerEvent::failure()))
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
