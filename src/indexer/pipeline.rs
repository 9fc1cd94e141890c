use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{RagError, Result};
use crate::index::{ClientIndex, DocumentRecord};
use crate::indexer::chunker::Chunker;
use crate::indexer::extract::{TextExtractor, format_hint};
use crate::indexer::soap;
use crate::registry::{ClientRegistry, content_hash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Processed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentOutcome {
    pub filename: String,
    pub status: Outcome,
    pub chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub client_id: String,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcomes: Vec<DocumentOutcome>,
}

impl IngestReport {
    fn push(&mut self, filename: &str, status: Outcome, chunks: usize, error: Option<String>) {
        match status {
            Outcome::Processed => self.processed += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failed => self.failed += 1,
        }
        self.outcomes.push(DocumentOutcome {
            filename: filename.to_string(),
            status,
            chunks,
            error,
        });
    }
}

/// Extract → chunk → embed → replace, for every document that changed.
pub struct IngestionPipeline {
    registry: Arc<ClientRegistry>,
    extractor: Arc<dyn TextExtractor>,
    chunker: Chunker,
    soap_sections: bool,
}

impl IngestionPipeline {
    pub fn new(registry: Arc<ClientRegistry>, extractor: Arc<dyn TextExtractor>, chunker: Chunker) -> Self {
        Self {
            registry,
            extractor,
            chunker,
            soap_sections: true,
        }
    }

    /// Chunk SOAP-style notes by section (on by default).
    #[must_use]
    pub fn with_soap_sections(mut self, enabled: bool) -> Self {
        self.soap_sections = enabled;
        self
    }

    /// Ingest a client's documents, sequentially and in filename order.
    ///
    /// Unchanged documents are skipped unless `force` is set. A document
    /// whose text cannot be extracted is marked failed and the batch goes
    /// on, as does one deleted while it was being processed. Index failures
    /// abort the batch.
    pub async fn ingest(&self, client_id: &str, force: bool) -> Result<IngestReport> {
        let index = self.registry.index(client_id)?;
        let docs = {
            let index = index.clone();
            tokio::task::spawn_blocking(move || index.list_documents()).await??
        };

        let mut report = IngestReport {
            client_id: index.client_id().to_string(),
            ..IngestReport::default()
        };

        for doc in docs {
            if !doc.needs_ingestion(force) {
                report.push(&doc.filename, Outcome::Skipped, doc.chunk_count, None);
                continue;
            }

            let path = self.registry.document_path(index.client_id(), &doc.filename)?;
            match self.ingest_document(index.clone(), &doc, path).await {
                Ok(chunks) => report.push(&doc.filename, Outcome::Processed, chunks, None),
                Err(e @ (RagError::Extraction(_) | RagError::Io(_))) => {
                    let message = e.to_string();
                    warn!("Failed to ingest '{}': {message}", doc.filename);
                    let failed_index = index.clone();
                    let filename = doc.filename.clone();
                    let recorded = message.clone();
                    tokio::task::spawn_blocking(move || {
                        failed_index.mark_failed(&filename, &recorded)
                    })
                    .await??;
                    report.push(&doc.filename, Outcome::Failed, 0, Some(message));
                }
                Err(RagError::NotFound(_)) => {
                    warn!("'{}' was deleted during ingestion", doc.filename);
                    report.push(
                        &doc.filename,
                        Outcome::Failed,
                        0,
                        Some("document was deleted during ingestion".to_string()),
                    );
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Ingested '{}': {} processed, {} skipped, {} failed",
            report.client_id, report.processed, report.skipped, report.failed
        );
        Ok(report)
    }

    async fn ingest_document(
        &self,
        index: Arc<ClientIndex>,
        doc: &DocumentRecord,
        path: PathBuf,
    ) -> Result<usize> {
        let extractor = self.extractor.clone();
        let chunker = self.chunker;
        let soap_sections = self.soap_sections;
        let filename = doc.filename.clone();

        tokio::task::spawn_blocking(move || {
            let raw = std::fs::read(&path)?;
            let text = extractor.extract_text(&raw, &format_hint(&filename))?;
            let chunks = if soap_sections {
                soap::chunk_sections(&chunker, &text)
            } else {
                chunker.chunk(&text)
            };
            index.replace_document(&filename, &content_hash(&raw), &chunks)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IngestionStatus;
    use crate::indexer::extract::{DefaultExtractor, ExtractError};
    use crate::indexer::soap::Section;
    use crate::registry::tests::open_registry;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Runs `hook` once, on the first extraction, after the bytes were read.
    struct HookedExtractor {
        fired: AtomicBool,
        hook: Box<dyn Fn() + Send + Sync>,
    }

    impl HookedExtractor {
        fn new(hook: impl Fn() + Send + Sync + 'static) -> Self {
            Self {
                fired: AtomicBool::new(false),
                hook: Box::new(hook),
            }
        }
    }

    impl TextExtractor for HookedExtractor {
        fn extract_text(&self, raw: &[u8], format_hint: &str) -> std::result::Result<String, ExtractError> {
            if !self.fired.swap(true, Ordering::SeqCst) {
                (self.hook)();
            }
            DefaultExtractor.extract_text(raw, format_hint)
        }
    }

    fn pipeline(registry: Arc<ClientRegistry>) -> IngestionPipeline {
        IngestionPipeline::new(
            registry,
            Arc::new(DefaultExtractor),
            Chunker::new(200, 40).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_ingest_differential_sync() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(open_registry(dir.path()));
        registry.create("jane_doe").unwrap();
        registry
            .upload_document("jane_doe", "session1.txt", b"Patient reports improved sleep.")
            .unwrap();
        registry
            .upload_document("jane_doe", "session2.md", b"# Session 2\n\nMood stable.")
            .unwrap();
        let pipeline = pipeline(registry.clone());

        // First run ingests both
        let first = pipeline.ingest("jane_doe", false).await.unwrap();
        assert_eq!(first.processed, 2);
        assert_eq!(first.skipped, 0);
        let chunk_ids = registry
            .index("jane_doe")
            .unwrap()
            .document_chunk_ids("session1.txt")
            .unwrap();

        // Second run is a no-op
        let second = pipeline.ingest("jane_doe", false).await.unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(
            registry
                .index("jane_doe")
                .unwrap()
                .document_chunk_ids("session1.txt")
                .unwrap(),
            chunk_ids
        );

        // Forced run reprocesses everything
        let third = pipeline.ingest("jane_doe", true).await.unwrap();
        assert_eq!(third.processed, 2);
    }

    #[tokio::test]
    async fn test_changed_document_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(open_registry(dir.path()));
        registry.create("jane_doe").unwrap();
        let long = "Sleep was discussed at length. ".repeat(30);
        registry
            .upload_document("jane_doe", "notes.txt", long.as_bytes())
            .unwrap();
        let pipeline = pipeline(registry.clone());
        pipeline.ingest("jane_doe", false).await.unwrap();
        let index = registry.index("jane_doe").unwrap();
        assert!(index.stats().unwrap().chunks > 1);

        registry
            .upload_document("jane_doe", "notes.txt", b"Short now.")
            .unwrap();
        let report = pipeline.ingest("jane_doe", false).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(index.document_chunk_ids("notes.txt").unwrap(), vec!["notes.txt#0000"]);
        assert_eq!(index.query("Short", 5, None).unwrap()[0].text, "Short now.");
    }

    #[tokio::test]
    async fn test_extraction_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(open_registry(dir.path()));
        registry.create("jane_doe").unwrap();
        registry
            .upload_document("jane_doe", "a_scan.pdf", b"definitely not a pdf")
            .unwrap();
        registry
            .upload_document("jane_doe", "b_legacy.doc", b"old binary format")
            .unwrap();
        registry
            .upload_document("jane_doe", "c_notes.txt", b"Patient reports improved sleep.")
            .unwrap();

        let report = pipeline(registry.clone())
            .ingest("jane_doe", false)
            .await
            .unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.processed, 1);
        let names: Vec<_> = report.outcomes.iter().map(|o| o.filename.as_str()).collect();
        assert_eq!(names, vec!["a_scan.pdf", "b_legacy.doc", "c_notes.txt"]);

        let docs = registry.list_documents("jane_doe").unwrap();
        assert_eq!(docs[0].status, IngestionStatus::Failed);
        assert!(docs[1].last_error.as_deref().unwrap().contains("unsupported format"));
        assert_eq!(docs[2].status, IngestionStatus::Ingested);
    }

    #[tokio::test]
    async fn test_unknown_client() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(open_registry(dir.path()));
        let err = pipeline(registry).ingest("nobody", false).await.unwrap_err();
        assert!(matches!(err, RagError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_empty_document_ingests_with_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(open_registry(dir.path()));
        registry.create("jane_doe").unwrap();
        registry
            .upload_document("jane_doe", "blank.txt", b"   \n\n ")
            .unwrap();

        let report = pipeline(registry.clone())
            .ingest("jane_doe", false)
            .await
            .unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.outcomes[0].chunks, 0);
        assert_eq!(registry.index("jane_doe").unwrap().stats().unwrap().ingested, 1);
    }

    #[tokio::test]
    async fn test_upload_during_extraction_is_picked_up_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(open_registry(dir.path()));
        registry.create("jane_doe").unwrap();
        registry
            .upload_document("jane_doe", "s.txt", b"old notes about sleep")
            .unwrap();

        let racing = registry.clone();
        let extractor = HookedExtractor::new(move || {
            racing
                .upload_document("jane_doe", "s.txt", b"new notes about finances")
                .unwrap();
        });
        let pipeline = IngestionPipeline::new(
            registry.clone(),
            Arc::new(extractor),
            Chunker::new(200, 40).unwrap(),
        );

        let first = pipeline.ingest("jane_doe", false).await.unwrap();
        assert_eq!(first.processed, 1);
        let doc = registry.list_documents("jane_doe").unwrap().remove(0);
        assert_eq!(doc.content_hash, content_hash(b"new notes about finances"));
        assert_eq!(doc.size_bytes, 24);
        assert_eq!(doc.ingested_hash, Some(content_hash(b"old notes about sleep")));
        assert_eq!(doc.status, IngestionStatus::NotIngested);

        let second = pipeline.ingest("jane_doe", false).await.unwrap();
        assert_eq!(second.processed, 1);
        let index = registry.index("jane_doe").unwrap();
        let top = index.query("finances", 1, None).unwrap();
        assert_eq!(top[0].text, "new notes about finances");
        assert_eq!(index.stats().unwrap().chunks, 1);
        assert!(!registry.list_documents("jane_doe").unwrap()[0].needs_ingestion(false));
    }

    #[tokio::test]
    async fn test_delete_during_ingestion_does_not_abort_batch() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(open_registry(dir.path()));
        registry.create("jane_doe").unwrap();
        registry
            .upload_document("jane_doe", "a_first.txt", b"Patient reports improved sleep.")
            .unwrap();
        registry
            .upload_document("jane_doe", "b_second.txt", b"Discussed holiday budgeting.")
            .unwrap();

        let racing = registry.clone();
        let extractor = HookedExtractor::new(move || {
            racing.delete_document("jane_doe", "a_first.txt").unwrap();
        });
        let pipeline = IngestionPipeline::new(
            registry.clone(),
            Arc::new(extractor),
            Chunker::new(200, 40).unwrap(),
        );

        let report = pipeline.ingest("jane_doe", false).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(report.outcomes[0].filename, "a_first.txt");
        assert!(report.outcomes[0].error.as_deref().unwrap().contains("deleted"));
        assert_eq!(report.outcomes[1].status, Outcome::Processed);

        let index = registry.index("jane_doe").unwrap();
        assert!(index.document_chunk_ids("a_first.txt").unwrap().is_empty());
        assert_eq!(index.stats().unwrap().documents, 1);
        assert_eq!(index.stats().unwrap().chunks, 1);
    }

    #[tokio::test]
    async fn test_soap_note_chunked_by_section() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(open_registry(dir.path()));
        registry.create("jane_doe").unwrap();
        let note = "S: Client reports sleeping better.\nO: Calm and engaged.\nP: Keep the sleep diary.\n";
        registry
            .upload_document("jane_doe", "soap.txt", note.as_bytes())
            .unwrap();
        let index = registry.index("jane_doe").unwrap();

        pipeline(registry.clone()).ingest("jane_doe", false).await.unwrap();
        let sections: Vec<Section> = index
            .list_chunks(Some("soap.txt"))
            .unwrap()
            .iter()
            .map(|c| c.section)
            .collect();
        assert_eq!(
            sections,
            vec![Section::Subjective, Section::Objective, Section::Plan]
        );

        pipeline(registry.clone())
            .with_soap_sections(false)
            .ingest("jane_doe", true)
            .await
            .unwrap();
        let chunks = index.list_chunks(Some("soap.txt")).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].section, Section::Unstructured);
    }
}
