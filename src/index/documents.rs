use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::ClientIndex;
use super::models::DocumentRecord;
use crate::error::Result;

const DOCUMENT_COLUMNS: &str = "filename, size_bytes, content_hash, uploaded_at, status, \
     ingested_hash, ingested_at, chunk_count, last_error";

fn map_document_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentRecord> {
    Ok(DocumentRecord {
        filename: row.get(0)?,
        size_bytes: row.get::<_, i64>(1)? as u64,
        content_hash: row.get(2)?,
        uploaded_at: row.get(3)?,
        status: row.get(4)?,
        ingested_hash: row.get(5)?,
        ingested_at: row.get(6)?,
        chunk_count: row.get::<_, i64>(7)? as usize,
        last_error: row.get(8)?,
    })
}

impl ClientIndex {
    /// Record an uploaded (or re-uploaded) document in the inventory.
    ///
    /// A changed hash resets the status to `not_ingested`; the old chunks
    /// stay searchable until the next ingestion replaces them.
    pub fn record_upload(
        &self,
        filename: &str,
        size_bytes: u64,
        content_hash: &str,
        uploaded_at: DateTime<Utc>,
    ) -> Result<DocumentRecord> {
        let conn = self.writer()?;
        conn.execute(
            r#"
            INSERT INTO documents (filename, size_bytes, content_hash, uploaded_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(filename) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                content_hash = excluded.content_hash,
                uploaded_at = excluded.uploaded_at,
                status = CASE
                    WHEN documents.ingested_hash = excluded.content_hash THEN documents.status
                    ELSE 'not_ingested'
                END,
                last_error = CASE
                    WHEN documents.ingested_hash = excluded.content_hash THEN documents.last_error
                    ELSE NULL
                END
            "#,
            params![filename, size_bytes as i64, content_hash, uploaded_at],
        )?;
        let record = conn.query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE filename = ?"),
            params![filename],
            map_document_row,
        )?;
        Ok(record)
    }

    pub fn get_document(&self, filename: &str) -> Result<Option<DocumentRecord>> {
        let conn = self.reader()?;
        let record = conn
            .query_row(
                &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE filename = ?"),
                params![filename],
                map_document_row,
            )
            .optional()?;
        Ok(record)
    }

    /// All documents, ordered by filename.
    pub fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY filename"
        ))?;
        let rows = stmt.query_map([], map_document_row)?;
        let mut docs = Vec::new();
        for row in rows {
            docs.push(row?);
        }
        Ok(docs)
    }

    /// Flag a document whose extraction failed. Its previous chunks, if
    /// any, are left in place.
    pub fn mark_failed(&self, filename: &str, error: &str) -> Result<()> {
        let conn = self.writer()?;
        conn.execute(
            "UPDATE documents SET status = 'failed', last_error = ?2 WHERE filename = ?1",
            params![filename, error],
        )?;
        Ok(())
    }

    /// Remove a document and all of its chunks in one transaction.
    ///
    /// Returns `false` when the document was not in the inventory.
    pub fn delete_document(&self, filename: &str) -> Result<bool> {
        let mut conn = self.writer()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chunks WHERE document = ?", params![filename])?;
        let rows = tx.execute("DELETE FROM documents WHERE filename = ?", params![filename])?;
        tx.commit()?;
        Ok(rows > 0)
    }
}
