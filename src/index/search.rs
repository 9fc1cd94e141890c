use rusqlite::types::Value;

use super::models::Passage;
use super::{ClientIndex, serialize_vector};
use crate::error::Result;

fn map_passage_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Passage> {
    let distance: f64 = row.get(5)?;
    Ok(Passage {
        chunk_id: row.get(0)?,
        filename: row.get(1)?,
        sequence: row.get::<_, i64>(2)? as usize,
        text: row.get(3)?,
        section: row.get(4)?,
        score: 1.0 - distance,
    })
}

impl ClientIndex {
    /// Top-`k` chunks by cosine similarity to `text`.
    ///
    /// Ties are broken by insertion order. `documents` restricts the
    /// candidates to the given filenames.
    pub fn query(&self, text: &str, k: usize, documents: Option<&[String]>) -> Result<Vec<Passage>> {
        if k == 0 || text.trim().is_empty() {
            return Ok(Vec::new());
        }
        if self.stats()?.chunks == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embedder().embed(text)?;

        let mut sql = String::from(
            r#"
            SELECT
                c.chunk_id,
                c.document,
                c.sequence,
                c.content,
                c.section,
                vec_distance_cosine(c.embedding, ?) AS distance
            FROM chunks c
            "#,
        );
        let mut params: Vec<Value> = vec![Value::Blob(serialize_vector(&query_vector))];

        if let Some(docs) = documents {
            if docs.is_empty() {
                return Ok(Vec::new());
            }
            let placeholders = vec!["?"; docs.len()].join(", ");
            sql.push_str(&format!(" WHERE c.document IN ({placeholders})"));
            params.extend(docs.iter().map(|d| Value::Text(d.clone())));
        }

        sql.push_str(" ORDER BY distance ASC, c.id ASC LIMIT ?");
        params.push(Value::Integer(k as i64));

        let conn = self.reader()?;
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(|p| p as &dyn rusqlite::ToSql).collect();
        let rows = stmt.query_map(param_refs.as_slice(), map_passage_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}
