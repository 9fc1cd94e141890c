//! Overlapping text chunking.
//!
//! Offsets and sizes are counted in `char`s. Chunks are never trimmed: the
//! first chunk followed by every later chunk minus its leading `overlap`
//! chars reproduces the input exactly.
use serde::Serialize;

use super::soap::Section;
use crate::error::{RagError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextChunk {
    pub sequence: usize,
    pub char_start: usize,
    pub char_end: usize,
    pub text: String,
    pub section: Section,
}

/// Validated chunking parameters.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(max_chunk_size: usize, overlap: usize) -> Result<Self> {
        if max_chunk_size == 0 {
            return Err(RagError::InvalidInput(
                "max chunk size must be positive".to_string(),
            ));
        }
        if overlap >= max_chunk_size {
            return Err(RagError::InvalidInput(format!(
                "overlap ({overlap}) must be smaller than max chunk size ({max_chunk_size})"
            )));
        }
        Ok(Self {
            max_chunk_size,
            overlap,
        })
    }

    #[must_use]
    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    #[must_use]
    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Split `text` into overlapping chunks. Whitespace-only input yields none.
    #[must_use]
    pub fn chunk(&self, text: &str) -> Vec<TextChunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let chars: Vec<char> = text.chars().collect();
        let total = chars.len();
        let mut chunks = Vec::new();
        let mut start = 0;

        loop {
            let limit = (start + self.max_chunk_size).min(total);
            let end = if limit == total {
                total
            } else {
                self.find_cut(&chars, start, limit)
            };

            chunks.push(TextChunk {
                sequence: chunks.len(),
                char_start: start,
                char_end: end,
                text: chars[start..end].iter().collect(),
                section: Section::Unstructured,
            });

            if end == total {
                break;
            }
            // find_cut never returns a cut at or before start + overlap
            start = end - self.overlap;
        }

        chunks
    }

    /// Pick the exclusive end of the chunk starting at `start`.
    ///
    /// Searches backwards from `limit` to the middle of the window, trying
    /// paragraph breaks, then line breaks, then sentence ends, then any
    /// whitespace. Falls back to a hard cut at `limit`.
    fn find_cut(&self, chars: &[char], start: usize, limit: usize) -> usize {
        let floor = start + (self.overlap + 1).max(self.max_chunk_size / 2);
        if floor >= limit {
            return limit;
        }

        let candidates = || (floor..=limit).rev();

        let paragraph = |end: usize| end - start >= 2 && chars[end - 2] == '\n' && chars[end - 1] == '\n';
        let line = |end: usize| chars[end - 1] == '\n';
        let sentence = |end: usize| {
            let c = chars[end - 1];
            c == '。' || (matches!(c, '.' | '!' | '?') && chars.get(end).is_none_or(|n| n.is_whitespace()))
        };
        let space = |end: usize| chars[end - 1].is_whitespace();

        candidates()
            .find(|&e| paragraph(e))
            .or_else(|| candidates().find(|&e| line(e)))
            .or_else(|| candidates().find(|&e| sentence(e)))
            .or_else(|| candidates().find(|&e| space(e)))
            .unwrap_or(limit)
    }
}

/// Convenience wrapper: validate the parameters and chunk `text`.
pub fn chunk(text: &str, max_chunk_size: usize, overlap: usize) -> Result<Vec<TextChunk>> {
    Ok(Chunker::new(max_chunk_size, overlap)?.chunk(text))
}
