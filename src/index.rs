//! In-memory similarity index.
//!
//! A linear-scan cosine-similarity index over [`IndexItem`]s, sized for
//! thousands of chunks. The index is not internally synchronized: the
//! resource indexer owns it mutably while building, then publishes it
//! behind an `Arc` so readers get a stable snapshot.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::models::IndexItem;

/// A search result: the matching item and its cosine similarity to the query.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub item: IndexItem,
    pub score: f32,
}

pub struct SimilarityIndex {
    items: Vec<IndexItem>,
    /// `(source, sequence)` → position in `items`.
    positions: HashMap<(String, usize), usize>,
    dims: Option<usize>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl SimilarityIndex {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            items: Vec::new(),
            positions: HashMap::new(),
            dims: None,
            provider,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Vector dimensionality shared by every item, once the first item is added.
    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    pub fn items(&self) -> &[IndexItem] {
        &self.items
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Embed `text` and append it.
    ///
    /// Embedding failures are logged and swallowed; callers detect them by
    /// the item's absence.
    pub async fn add_item(
        &mut self,
        text: &str,
        source: &str,
        sequence: usize,
        metadata: BTreeMap<String, String>,
    ) {
        let vector = match self.provider.embed(text).await {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => {
                tracing::warn!(source, sequence, "embedding provider returned an empty vector");
                return;
            }
            Err(e) => {
                tracing::warn!(source, sequence, error = %e, "embedding failed, item not indexed");
                return;
            }
        };

        self.add_embedded(IndexItem {
            id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            source: source.to_string(),
            vector,
            sequence,
            metadata,
        });
    }

    /// Append an item whose vector is already computed.
    ///
    /// Returns `false` (and drops the item) when its dimensionality differs
    /// from the items already present.
    pub fn add_embedded(&mut self, item: IndexItem) -> bool {
        if item.vector.is_empty() {
            tracing::warn!(source = %item.source, "refusing item with empty vector");
            return false;
        }
        match self.dims {
            Some(d) if d != item.vector.len() => {
                tracing::warn!(
                    source = %item.source,
                    expected = d,
                    got = item.vector.len(),
                    "refusing item with mismatched dimensionality"
                );
                return false;
            }
            None => self.dims = Some(item.vector.len()),
            _ => {}
        }

        self.positions
            .insert((item.source.clone(), item.sequence), self.items.len());
        self.items.push(item);
        true
    }

    /// Embed the query and return up to `max_results` items by descending
    /// similarity. An empty index returns no hits without calling the
    /// embedding provider.
    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>> {
        if self.items.is_empty() || max_results == 0 {
            return Ok(Vec::new());
        }
        let query_vec = self.provider.embed(query).await?;
        Ok(self.search_by_vector(&query_vec, max_results))
    }

    /// Rank every item against `query`. Ties keep insertion order.
    pub fn search_by_vector(&self, query: &[f32], max_results: usize) -> Vec<SearchHit> {
        let mut scored: Vec<(usize, f32)> = self
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (i, cosine_similarity(query, &item.vector)))
            .collect();

        // Stable sort keeps insertion order among equal scores.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        scored
            .into_iter()
            .take(max_results)
            .map(|(i, score)| SearchHit {
                item: self.items[i].clone(),
                score,
            })
            .collect()
    }

    /// The chunk at `sequence` within `source`, if indexed.
    pub fn neighbor(&self, source: &str, sequence: usize) -> Option<&IndexItem> {
        self.positions
            .get(&(source.to_string(), sequence))
            .map(|&i| &self.items[i])
    }
}
