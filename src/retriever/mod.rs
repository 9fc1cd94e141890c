//! Query-time retrieval over one client's index.
//!
//! Vector search over-fetches candidates which [`rerank`] then scores,
//! diversifies and thresholds.
pub mod rerank;

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::index::Passage;
use crate::registry::ClientRegistry;

/// A ranked passage with its attribution.
pub type RetrievedPassage = Passage;

pub struct Retriever {
    registry: Arc<ClientRegistry>,
}

impl Retriever {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    /// Up to `top_k` re-ranked passages of `client_id` for `query`.
    ///
    /// `document_ids` limits the search to those filenames; an empty list
    /// means no restriction. A non-empty index always yields at least one
    /// passage.
    pub async fn retrieve(
        &self,
        client_id: &str,
        query: &str,
        top_k: usize,
        document_ids: Option<&[String]>,
    ) -> Result<Vec<RetrievedPassage>> {
        let index = self.registry.index(client_id)?;
        if top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let owned_query = query.to_string();
        let filter: Option<Vec<String>> = document_ids
            .filter(|ids| !ids.is_empty())
            .map(<[String]>::to_vec);
        let candidates = rerank::candidate_count(top_k);

        let raw = tokio::task::spawn_blocking(move || {
            index.query(&owned_query, candidates, filter.as_deref())
        })
        .await??;
        let fetched = raw.len();
        let passages = rerank::rerank(raw, query, top_k);

        debug!(
            "Retrieved {} of {fetched} candidates for '{client_id}'",
            passages.len()
        );
        Ok(passages)
    }
}
