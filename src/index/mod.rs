//! Per-client embedding index: SQLite + sqlite-vec.
//!
//! Each client gets its own database file, so one client's passages can
//! never surface in another client's results. The index owns the embedder
//! it was built with and records its identity in `index_meta`; reopening
//! with a different embedder is refused.
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Once};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use sqlite_vec::sqlite3_vec_init;
use tracing::{debug, info};

use crate::embedder::Embedder;
use crate::error::{RagError, Result};

pub mod chunks;
pub mod documents;
pub mod models;
pub mod search;

pub use models::{ChunkRecord, DocumentRecord, IndexStats, IngestionStatus, Passage, StoredChunk};

const INDEX_FILE: &str = "index.db";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS index_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS documents (
    filename TEXT PRIMARY KEY,
    size_bytes INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    uploaded_at DATETIME NOT NULL,
    status TEXT NOT NULL DEFAULT 'not_ingested',
    ingested_hash TEXT,
    ingested_at DATETIME,
    chunk_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chunk_id TEXT NOT NULL UNIQUE,
    document TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    char_start INTEGER NOT NULL,
    char_end INTEGER NOT NULL,
    content TEXT NOT NULL,
    section TEXT NOT NULL DEFAULT 'unstructured',
    embedding BLOB NOT NULL,
    FOREIGN KEY (document) REFERENCES documents(filename) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document);
"#;

static INIT_VEC: Once = Once::new();

/// Initialize the sqlite-vec extension. Safe to call multiple times.
fn init_sqlite_vec() {
    INIT_VEC.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    debug!("journal_mode = {mode}");
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(())
}

/// Handle to one client's index.
///
/// Writes go through `writer` and are serialized; queries use `reader` and
/// see a consistent WAL snapshot while a write is in flight. All methods
/// block: async callers use `spawn_blocking`.
pub struct ClientIndex {
    client_id: String,
    path: PathBuf,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    embedder: Arc<dyn Embedder>,
}

impl ClientIndex {
    /// Open (or create) the index stored in `dir`.
    pub fn open(client_id: &str, dir: &Path, embedder: Arc<dyn Embedder>) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(INDEX_FILE);
        debug!("Opening index for '{client_id}': {}", path.display());

        // Register sqlite-vec extension globally
        init_sqlite_vec();

        let writer = Connection::open(&path)?;
        configure(&writer)?;

        // Verify sqlite-vec is loaded
        let vec_version: String = writer.query_row("SELECT vec_version()", [], |row| row.get(0))?;
        debug!("sqlite-vec version: {vec_version}");

        writer.execute_batch(SCHEMA_SQL)?;
        check_embedder(&writer, client_id, embedder.as_ref())?;

        let reader = Connection::open(&path)?;
        configure(&reader)?;
        reader.execute_batch("PRAGMA query_only = ON;")?;

        info!("Index ready for client '{client_id}' ({})", embedder.model_id());

        Ok(Self {
            client_id: client_id.to_string(),
            path,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            embedder,
        })
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    pub(crate) fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| RagError::Index(format!("writer lock poisoned for '{}'", self.client_id)))
    }

    pub(crate) fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| RagError::Index(format!("reader lock poisoned for '{}'", self.client_id)))
    }

    pub(crate) fn embed_texts(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let vectors = self.embedder.embed_batch(texts)?;
        if vectors.len() != texts.len() {
            return Err(RagError::Index(format!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }

    /// Document, ingested-document and chunk counts.
    pub fn stats(&self) -> Result<IndexStats> {
        let conn = self.reader()?;
        let (documents, ingested): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(status = 'ingested'), 0) FROM documents",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let chunks: i64 = conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(IndexStats {
            documents: documents as usize,
            ingested: ingested as usize,
            chunks: chunks as usize,
        })
    }

    /// Flush the WAL into the main database file.
    pub fn close(&self) -> Result<()> {
        let conn = self.writer()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        debug!("Checkpointed index for '{}'", self.client_id);
        Ok(())
    }
}

/// Record the embedder identity on first open; refuse a different one later.
fn check_embedder(conn: &Connection, client_id: &str, embedder: &dyn Embedder) -> Result<()> {
    let model: Option<String> = conn
        .query_row(
            "SELECT value FROM index_meta WHERE key = 'embedding_model'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    let dims: Option<String> = conn
        .query_row(
            "SELECT value FROM index_meta WHERE key = 'embedding_dimensions'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let current_model = embedder.model_id();
    let current_dims = embedder.dimensions().to_string();

    match (model, dims) {
        (Some(model), Some(dims)) if model == current_model && dims == current_dims => Ok(()),
        (Some(model), dims) => Err(RagError::Index(format!(
            "index for client '{client_id}' was built with embedding model '{model}' ({} dims) \
             but '{current_model}' ({current_dims} dims) is configured; delete the index and re-ingest",
            dims.unwrap_or_else(|| "?".to_string())
        ))),
        (None, _) => {
            conn.execute(
                "INSERT OR REPLACE INTO index_meta (key, value) VALUES ('embedding_model', ?1), ('embedding_dimensions', ?2)",
                params![current_model, current_dims],
            )?;
            Ok(())
        }
    }
}

/// Helper to serialize a float32 vector into a little-endian BLOB for sqlite-vec
pub fn serialize_vector(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}
