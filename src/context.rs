/// Process-wide application context.
///
/// Owns the catalog, the client registry (with every open index handle),
/// the session store and the model providers. Built once at startup and
/// torn down with [`AppContext::shutdown`].
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use serde::Deserialize;
use tracing::info;

use crate::answer::{AnswerGenerator, AnswerStream};
use crate::config::Config;
use crate::db::Db;
use crate::db::models::Message;
use crate::embedder::{self, Embedder};
use crate::error::{RagError, Result};
use crate::indexer::{Chunker, DefaultExtractor, IngestReport, IngestionPipeline, TextExtractor};
use crate::llm::{LanguageModel, OllamaModel, ScriptedModel};
use crate::registry::ClientRegistry;
use crate::retriever::{RetrievedPassage, Retriever};
use crate::sessions::SessionStore;

/// A question about one client's documents.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub client_id: String,
    pub query: String,
    #[serde(default)]
    pub document_ids: Option<Vec<String>>,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default)]
    pub top_k: Option<usize>,
    /// When set, the exchange is appended to this session.
    #[serde(default)]
    pub session_id: Option<String>,
}

pub struct AppContext {
    pub config: Arc<Config>,
    pub registry: Arc<ClientRegistry>,
    pub sessions: Arc<SessionStore>,
    pub pipeline: IngestionPipeline,
    pub retriever: Retriever,
    pub generator: AnswerGenerator,
}

impl AppContext {
    /// Build the context from explicit providers.
    pub fn open(
        config: Config,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
        extractor: Arc<dyn TextExtractor>,
    ) -> Result<Self> {
        let chunker = Chunker::new(config.chunk_size, config.chunk_overlap)?;
        std::fs::create_dir_all(&config.data_dir)?;

        let db = Arc::new(Mutex::new(Db::open(config.app_db_path())?));
        let registry = Arc::new(ClientRegistry::open(
            db.clone(),
            &config.clients_dir(),
            embedder,
        )?);
        let sessions = Arc::new(SessionStore::new(db));

        info!("Application context ready (data dir: {})", config.data_dir);

        Ok(Self {
            pipeline: IngestionPipeline::new(registry.clone(), extractor, chunker)
                .with_soap_sections(config.soap_sections),
            retriever: Retriever::new(registry.clone()),
            generator: AnswerGenerator::new(llm, config.history_turns),
            config: Arc::new(config),
            registry,
            sessions,
        })
    }

    /// Build the context with the providers named in `config`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        config.validate()?;
        let embedder =
            embedder::from_config(&config.embedding).context("failed to create embedder")?;
        let llm: Arc<dyn LanguageModel> = match config.llm.provider.as_str() {
            "scripted" => Arc::new(ScriptedModel::from_config(&config.llm)),
            _ => Arc::new(OllamaModel::new(&config.llm).context("failed to create LLM client")?),
        };
        Ok(Self::open(
            config,
            embedder,
            llm,
            Arc::new(DefaultExtractor),
        )?)
    }

    pub async fn ingest(&self, client_id: &str, force: bool) -> Result<IngestReport> {
        self.pipeline.ingest(client_id, force).await
    }

    pub async fn retrieve(&self, request: &QueryRequest) -> Result<Vec<RetrievedPassage>> {
        let top_k = request.top_k.unwrap_or(self.config.search_top_k);
        self.retriever
            .retrieve(
                &request.client_id,
                &request.query,
                top_k,
                request.document_ids.as_deref(),
            )
            .await
    }

    /// Retrieve and start streaming an answer.
    ///
    /// Retrieval failures are returned here; generation failures arrive as
    /// the stream's terminal `Error` event.
    pub async fn ask(&self, request: &QueryRequest) -> Result<AnswerStream> {
        if request.query.trim().is_empty() {
            return Err(RagError::InvalidInput("query must not be empty".to_string()));
        }
        let client = self.registry.get(&request.client_id)?;
        let passages = self.retrieve(request).await?;
        Ok(self
            .generator
            .generate(&client.id, &request.query, &passages, &request.history))
    }

    /// Flush every index and the catalog.
    pub fn shutdown(&self) -> Result<()> {
        info!("Shutting down: checkpointing indexes");
        self.registry.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::AnswerEvent;
    use crate::embedder::hashing::HashingEmbedder;
    use crate::llm::ScriptedModel;
    use futures::StreamExt;

    fn context(dir: &std::path::Path, llm: Arc<dyn LanguageModel>) -> AppContext {
        let config = Config {
            data_dir: dir.to_string_lossy().to_string(),
            ..Config::default()
        };
        AppContext::open(
            config,
            Arc::new(HashingEmbedder::default()),
            llm,
            Arc::new(DefaultExtractor),
        )
        .unwrap()
    }

    fn request(client: &str, query: &str) -> QueryRequest {
        QueryRequest {
            client_id: client.to_string(),
            query: query.to_string(),
            document_ids: None,
            history: Vec::new(),
            top_k: None,
            session_id: None,
        }
    }

    #[tokio::test]
    async fn test_ask_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(ScriptedModel::new(["Sleep improved [1]."])));
        ctx.registry.create("Jane Doe").unwrap();
        ctx.registry
            .upload_document("jane_doe", "session1.txt", b"Patient reports improved sleep.")
            .unwrap();
        ctx.ingest("jane_doe", false).await.unwrap();

        let events: Vec<AnswerEvent> = ctx
            .ask(&request("jane_doe", "How is sleep?"))
            .await
            .unwrap()
            .collect()
            .await;
        match &events[0] {
            AnswerEvent::Metadata { sources } => {
                assert_eq!(sources[0].filename, "session1.txt");
            }
            other => panic!("expected metadata first, got {other:?}"),
        }
        assert_eq!(events.last(), Some(&AnswerEvent::Done));
        ctx.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_ask_validation() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), Arc::new(ScriptedModel::new(["x"])));
        assert!(matches!(
            ctx.ask(&request("nobody", "hi")).await,
            Err(RagError::NotFound(_))
        ));
        ctx.registry.create("jane_doe").unwrap();
        assert!(matches!(
            ctx.ask(&request("jane_doe", "  ")).await,
            Err(RagError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_from_config_with_scripted_provider() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            data_dir: dir.path().to_string_lossy().to_string(),
            ..Config::default()
        };
        config.llm.provider = "scripted".to_string();
        config.llm.scripted_response = "Offline answer.".to_string();
        let ctx = AppContext::from_config(config).unwrap();
        ctx.registry.create("jane_doe").unwrap();

        let answer = ctx
            .ask(&request("jane_doe", "How is sleep?"))
            .await
            .unwrap()
            .collect_answer()
            .await;
        assert_eq!(answer.text, "Offline answer.");
        assert!(answer.error.is_none());

        let mut bad = Config::default();
        bad.llm.provider = "gpt".to_string();
        assert!(AppContext::from_config(bad).is_err());
    }

    #[test]
    fn test_rejects_bad_chunking_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_string_lossy().to_string(),
            chunk_overlap: 2000,
            ..Config::default()
        };
        let result = AppContext::open(
            config,
            Arc::new(HashingEmbedder::default()),
            Arc::new(ScriptedModel::new(["x"])),
            Arc::new(DefaultExtractor),
        );
        assert!(matches!(result, Err(RagError::InvalidInput(_))));
    }
}
