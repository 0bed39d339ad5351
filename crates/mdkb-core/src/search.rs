//! Query engine
//!
//! Embeds the query, asks the store for the nearest documents, drops anything
//! farther than `max_distance`, and returns a short snippet per hit.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::embedder::EmbeddingClient;
use crate::storage::DocumentStore;

/// Default number of results
pub const DEFAULT_LIMIT: usize = 10;

/// Largest accepted `limit`
pub const MAX_LIMIT: usize = 100;

/// Default cosine distance cutoff
pub const DEFAULT_MAX_DISTANCE: f32 = 0.5;

/// Largest possible cosine distance
pub const MAX_COSINE_DISTANCE: f32 = 2.0;

/// Snippet length in characters
pub const SNIPPET_CHARS: usize = 600;

/// Why a search failed
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("query must not be empty")]
    InvalidQuery,

    #[error("limit must be between 1 and {MAX_LIMIT}, got {0}")]
    InvalidLimit(usize),

    #[error("max_distance must be between 0 and {MAX_COSINE_DISTANCE}, got {0}")]
    InvalidMaxDistance(f32),

    #[error("failed to embed query: {0:#}")]
    Embedding(anyhow::Error),

    #[error("store query failed: {0:#}")]
    Store(anyhow::Error),

    #[error("search timed out after {0}s")]
    Timeout(u64),
}

/// Search parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Maximum results to return
    pub limit: usize,
    /// Largest cosine distance a result may have
    pub max_distance: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            max_distance: DEFAULT_MAX_DISTANCE,
        }
    }
}

impl SearchOptions {
    /// Reject out-of-range values. Nothing is clamped.
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.limit == 0 || self.limit > MAX_LIMIT {
            return Err(SearchError::InvalidLimit(self.limit));
        }
        // NaN fails the range check too
        if !(0.0..=MAX_COSINE_DISTANCE).contains(&self.max_distance) {
            return Err(SearchError::InvalidMaxDistance(self.max_distance));
        }
        Ok(())
    }
}

/// A single search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub path: PathBuf,
    /// Bounded prefix of the document
    pub snippet: String,
    /// Cosine distance to the query (lower is closer)
    pub distance: f32,
}

/// Run a semantic search.
///
/// Results are ordered by ascending distance, ties by path. An embedding or
/// store failure is an error, never an empty result.
pub fn search(
    store: &dyn DocumentStore,
    embedder: &dyn EmbeddingClient,
    query: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchHit>, SearchError> {
    options.validate()?;
    let query = query.trim();
    if query.is_empty() {
        return Err(SearchError::InvalidQuery);
    }

    let vector = embedder.embed(query).map_err(SearchError::Embedding)?;
    let mut neighbors = store
        .nearest_neighbors(&vector, options.limit)
        .map_err(SearchError::Store)?;

    // The store contract already orders; enforce it regardless of backend
    neighbors.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.path.cmp(&b.path))
    });

    let hits: Vec<SearchHit> = neighbors
        .into_iter()
        .filter(|n| n.distance <= options.max_distance)
        .take(options.limit)
        .map(|n| SearchHit {
            snippet: make_snippet(&n.content, SNIPPET_CHARS),
            path: n.path,
            distance: n.distance,
        })
        .collect();

    tracing::debug!("Query {:?} returned {} results", query, hits.len());
    Ok(hits)
}

/// First `max_chars` characters with newlines flattened, `...` appended if cut
pub fn make_snippet(content: &str, max_chars: usize) -> String {
    let mut snippet: String = content
        .chars()
        .take(max_chars)
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    if content.chars().nth(max_chars).is_some() {
        snippet.push_str("...");
    }
    snippet
}
