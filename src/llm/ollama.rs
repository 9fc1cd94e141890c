use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt, stream};
use serde::Deserialize;
use tracing::debug;

use super::{GenerationError, LanguageModel, TokenStream};
use crate::config::LlmConfig;

/// One NDJSON line of Ollama's `/api/generate` stream.
#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

pub struct OllamaModel {
    pub model: String,
    pub base_url: String,
    client: reqwest::Client,
    idle_timeout: Duration,
}

impl OllamaModel {
    pub fn new(config: &LlmConfig) -> Result<Self, GenerationError> {
        // No overall timeout: long answers stream for a while. Stalls are
        // caught per fragment instead.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GenerationError::Connection(e.to_string()))?;
        Ok(Self {
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            idle_timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    async fn complete_stream(&self, prompt: &str) -> Result<TokenStream, GenerationError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": true
        });
        debug!("Requesting completion from {url} ({})", self.model);

        let request = self.client.post(&url).json(&body).send();
        let res = tokio::time::timeout(self.idle_timeout, request)
            .await
            .map_err(|_| GenerationError::Timeout)?
            .map_err(|e| {
                if e.is_timeout() {
                    GenerationError::Timeout
                } else {
                    GenerationError::Connection(format!("{url}: {e}"))
                }
            })?;

        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(GenerationError::Http { status, body });
        }

        Ok(ndjson_fragments(res.bytes_stream(), self.idle_timeout).boxed())
    }
}

struct NdjsonState<S> {
    bytes: S,
    buf: Vec<u8>,
    idle_timeout: Duration,
    finished: bool,
}

/// Parse one line into `(fragment, done)`. Blank lines yield `None`.
fn parse_line(line: &[u8]) -> Result<Option<(String, bool)>, GenerationError> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let chunk: GenerateChunk =
        serde_json::from_str(line).map_err(|e| GenerationError::Protocol(e.to_string()))?;
    if let Some(error) = chunk.error {
        return Err(GenerationError::Protocol(error));
    }
    Ok(Some((chunk.response, chunk.done)))
}

/// Decode an NDJSON byte stream into response fragments.
///
/// Ends after the line marked `done`. A stall longer than `idle_timeout`,
/// a transport error, a bad line or EOF before `done` ends the stream with
/// an error.
pub(crate) fn ndjson_fragments<S, B, E>(
    bytes: S,
    idle_timeout: Duration,
) -> impl Stream<Item = Result<String, GenerationError>> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = NdjsonState {
        bytes: Box::pin(bytes),
        buf: Vec::new(),
        idle_timeout,
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return None;
            }

            if let Some(pos) = st.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = st.buf.drain(..=pos).collect();
                match parse_line(&line) {
                    Ok(None) => continue,
                    Ok(Some((text, done))) => {
                        // The final line may still carry a trailing fragment
                        st.finished = done;
                        if text.is_empty() {
                            continue;
                        }
                        return Some((Ok(text), st));
                    }
                    Err(e) => {
                        st.finished = true;
                        return Some((Err(e), st));
                    }
                }
            }

            match tokio::time::timeout(st.idle_timeout, st.bytes.next()).await {
                Err(_) => {
                    st.finished = true;
                    return Some((Err(GenerationError::Timeout), st));
                }
                Ok(Some(Ok(chunk))) => st.buf.extend_from_slice(chunk.as_ref()),
                Ok(Some(Err(e))) => {
                    st.finished = true;
                    return Some((Err(GenerationError::Connection(e.to_string())), st));
                }
                Ok(None) => {
                    if st.buf.iter().all(u8::is_ascii_whitespace) {
                        st.finished = true;
                        return Some((
                            Err(GenerationError::Protocol(
                                "stream ended before completion".to_string(),
                            )),
                            st,
                        ));
                    }
                    // Last line without a trailing newline
                    st.buf.push(b'\n');
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    type Chunks = Vec<Result<Vec<u8>, String>>;

    async fn collect(chunks: Chunks) -> Vec<Result<String, GenerationError>> {
        ndjson_fragments(stream::iter(chunks), Duration::from_secs(5))
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_decodes_fragments_until_done() {
        let body = concat!(
            "{\"response\":\"Sleep \",\"done\":false}\n",
            "{\"response\":\"has improved.\",\"done\":false}\n",
            "{\"response\":\"\",\"done\":true}\n",
        );
        let out = collect(vec![Ok(body.as_bytes().to_vec())]).await;
        assert_eq!(
            out,
            vec![Ok("Sleep ".to_string()), Ok("has improved.".to_string())]
        );
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let out = collect(vec![
            Ok(b"{\"response\":\"Hel".to_vec()),
            Ok(b"lo\",\"done\":false}\n{\"resp".to_vec()),
            Ok(b"onse\":\"!\",\"done\":true}".to_vec()),
        ])
        .await;
        assert_eq!(out, vec![Ok("Hello".to_string()), Ok("!".to_string())]);
    }

    #[tokio::test]
    async fn test_eof_before_done_is_error() {
        let out = collect(vec![Ok(b"{\"response\":\"partial\",\"done\":false}\n".to_vec())]).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Ok("partial".to_string()));
        assert!(matches!(out[1], Err(GenerationError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_error_line_and_garbage() {
        let out = collect(vec![Ok(b"{\"error\":\"model not found\"}\n".to_vec())]).await;
        assert_eq!(
            out,
            vec![Err(GenerationError::Protocol("model not found".to_string()))]
        );

        let out = collect(vec![Ok(b"not json\n".to_vec())]).await;
        assert!(matches!(out[..], [Err(GenerationError::Protocol(_))]));
    }

    #[tokio::test]
    async fn test_transport_error() {
        let out = collect(vec![
            Ok(b"{\"response\":\"a\",\"done\":false}\n".to_vec()),
            Err("connection reset".to_string()),
        ])
        .await;
        assert_eq!(out[0], Ok("a".to_string()));
        assert_eq!(
            out[1],
            Err(GenerationError::Connection("connection reset".to_string()))
        );
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let model = OllamaModel::new(&LlmConfig {
            model: "mistral".to_string(),
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 5,
            ..LlmConfig::default()
        })
        .unwrap();
        let err = model.complete_stream("hi").await.err().unwrap();
        assert!(matches!(
            err,
            GenerationError::Connection(_) | GenerationError::Timeout
        ));
    }
}
