use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::models::SourceCitation;
use crate::indexer::soap::Section;

/// Stable id of the `sequence`-th chunk of `filename`.
#[must_use]
pub fn chunk_id(filename: &str, sequence: usize) -> String {
    format!("{filename}#{sequence:04}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    NotIngested,
    Ingested,
    Failed,
}

impl IngestionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotIngested => "not_ingested",
            Self::Ingested => "ingested",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "not_ingested" => Some(Self::NotIngested),
            "ingested" => Some(Self::Ingested),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl rusqlite::types::FromSql for IngestionStatus {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::parse(s).ok_or_else(|| {
            rusqlite::types::FromSqlError::Other(format!("unknown ingestion status '{s}'").into())
        })
    }
}

/// One entry of a client's document inventory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    pub filename: String,
    pub size_bytes: u64,
    pub content_hash: String,
    pub uploaded_at: DateTime<Utc>,
    pub status: IngestionStatus,
    pub ingested_hash: Option<String>,
    pub ingested_at: Option<DateTime<Utc>>,
    pub chunk_count: usize,
    pub last_error: Option<String>,
}

impl DocumentRecord {
    /// Whether the ingestion pipeline should (re)process this document.
    #[must_use]
    pub fn needs_ingestion(&self, force: bool) -> bool {
        force
            || self.status != IngestionStatus::Ingested
            || self.ingested_hash.as_deref() != Some(self.content_hash.as_str())
    }
}

/// A passage to store, before embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub document: String,
    pub sequence: usize,
    pub char_start: usize,
    pub char_end: usize,
    pub text: String,
    pub section: Section,
}

/// A chunk as stored, for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredChunk {
    pub chunk_id: String,
    pub filename: String,
    pub sequence: usize,
    pub char_start: usize,
    pub char_end: usize,
    pub section: Section,
    pub text: String,
}

/// A stored chunk scored against a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub chunk_id: String,
    pub filename: String,
    pub sequence: usize,
    pub text: String,
    pub section: Section,
    /// Cosine similarity in `[-1, 1]` out of the index; the retriever
    /// replaces it with its re-ranked score. Higher is closer either way.
    pub score: f64,
}

impl Passage {
    #[must_use]
    pub fn citation(&self) -> SourceCitation {
        SourceCitation {
            filename: self.filename.clone(),
            chunk_id: self.chunk_id.clone(),
            sequence: self.sequence,
            score: self.score,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub ingested: usize,
    pub chunks: usize,
}
