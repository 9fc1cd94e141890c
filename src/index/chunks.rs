use chrono::Utc;
use rusqlite::params;
use tracing::debug;

use super::models::{ChunkRecord, StoredChunk, chunk_id};
use super::{ClientIndex, serialize_vector};
use crate::error::{RagError, Result};
use crate::indexer::chunker::TextChunk;

const UPSERT_CHUNK_SQL: &str = r#"
    INSERT INTO chunks (chunk_id, document, sequence, char_start, char_end, content, section, embedding)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(chunk_id) DO UPDATE SET
        document = excluded.document,
        sequence = excluded.sequence,
        char_start = excluded.char_start,
        char_end = excluded.char_end,
        content = excluded.content,
        section = excluded.section,
        embedding = excluded.embedding
"#;

impl ClientIndex {
    /// Embed and store chunks, replacing any existing chunk with the same id.
    ///
    /// A replaced chunk keeps its original insertion position.
    pub fn upsert_chunks(&self, chunks: &[ChunkRecord]) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let vectors = self.embed_texts(&texts)?;

        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(UPSERT_CHUNK_SQL)?;
            for (chunk, vector) in chunks.iter().zip(&vectors) {
                stmt.execute(params![
                    chunk.chunk_id,
                    chunk.document,
                    chunk.sequence as i64,
                    chunk.char_start as i64,
                    chunk.char_end as i64,
                    chunk.text,
                    chunk.section,
                    serialize_vector(vector),
                ])?;
            }
        }
        tx.commit()?;
        Ok(chunks.len())
    }

    /// Atomically swap a document's chunks for a freshly chunked version of
    /// the bytes hashing to `ingested_hash`.
    ///
    /// The inventory's `content_hash` and `size_bytes` belong to the upload
    /// path and are never written here. If a newer upload landed while these
    /// chunks were being built, the hashes differ and the document stays
    /// `not_ingested` so the next run picks the new bytes up.
    ///
    /// Embedding happens before the transaction starts, so a provider
    /// failure leaves the previous chunks untouched.
    pub fn replace_document(
        &self,
        filename: &str,
        ingested_hash: &str,
        chunks: &[TextChunk],
    ) -> Result<usize> {
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            self.embed_texts(&texts)?
        };

        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let updated = tx.execute(
            r#"
            UPDATE documents SET
                status = CASE WHEN content_hash = ?2 THEN 'ingested' ELSE 'not_ingested' END,
                ingested_hash = ?2,
                ingested_at = ?3,
                chunk_count = ?4,
                last_error = NULL
            WHERE filename = ?1
            "#,
            params![filename, ingested_hash, Utc::now(), chunks.len() as i64],
        )?;
        if updated == 0 {
            return Err(RagError::NotFound(format!(
                "document '{filename}' is not in the inventory"
            )));
        }

        tx.execute("DELETE FROM chunks WHERE document = ?", params![filename])?;
        {
            let mut stmt = tx.prepare(UPSERT_CHUNK_SQL)?;
            for (chunk, vector) in chunks.iter().zip(&vectors) {
                stmt.execute(params![
                    chunk_id(filename, chunk.sequence),
                    filename,
                    chunk.sequence as i64,
                    chunk.char_start as i64,
                    chunk.char_end as i64,
                    chunk.text,
                    chunk.section,
                    serialize_vector(vector),
                ])?;
            }
        }
        tx.commit()?;

        debug!(
            "Replaced chunks of '{filename}' for '{}': {} chunks",
            self.client_id(),
            chunks.len()
        );
        Ok(chunks.len())
    }

    /// Chunk ids of one document, in sequence order.
    pub fn document_chunk_ids(&self, filename: &str) -> Result<Vec<String>> {
        let conn = self.reader()?;
        let mut stmt =
            conn.prepare("SELECT chunk_id FROM chunks WHERE document = ? ORDER BY sequence")?;
        let rows = stmt.query_map(params![filename], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Stored chunks in insertion order, optionally for one document only.
    pub fn list_chunks(&self, document: Option<&str>) -> Result<Vec<StoredChunk>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT chunk_id, document, sequence, char_start, char_end, section, content
            FROM chunks
            WHERE ?1 IS NULL OR document = ?1
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(params![document], |row| {
            Ok(StoredChunk {
                chunk_id: row.get(0)?,
                filename: row.get(1)?,
                sequence: row.get::<_, i64>(2)? as usize,
                char_start: row.get::<_, i64>(3)? as usize,
                char_end: row.get::<_, i64>(4)? as usize,
                section: row.get(5)?,
                text: row.get(6)?,
            })
        })?;
        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row?);
        }
        Ok(chunks)
    }
}
