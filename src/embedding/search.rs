//! Contract between the retrieval core and a vector similarity store

use super::VectorIndexError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What to search for: raw text (the store embeds it) or a ready embedding
#[derive(Debug, Clone, PartialEq)]
pub enum VectorQuery {
    Text(String),
    Embedding(Vec<f32>),
}

/// Restricts which chunks a vector query may return
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorFilter {
    /// Only chunks of these documents; `None` allows every document
    pub document_ids: Option<HashSet<String>>,
}

impl VectorFilter {
    /// A filter that admits everything
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_documents<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            document_ids: Some(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub fn allows(&self, document_id: &str) -> bool {
        self.document_ids
            .as_ref()
            .map_or(true, |ids| ids.contains(document_id))
    }
}

/// A vector search hit; higher similarity is better
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub chunk_id: String,
    pub score: f32,
}

/// A similarity search backend.
///
/// Results must be ordered by descending similarity. Any error is treated by
/// the retriever as the store being unavailable for that query.
///
/// `query` must not block the calling thread: the retriever enforces its
/// deadline with `tokio::time::timeout`, which only fires at an await point.
/// Move CPU-bound embedding or search onto `spawn_blocking`.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn query(
        &self,
        query: VectorQuery,
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>, VectorIndexError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_any_allows_all() {
        let filter = VectorFilter::any();
        assert!(filter.allows("doc-1"));
        assert!(filter.allows(""));
    }

    #[test]
    fn test_filter_for_documents() {
        let filter = VectorFilter::for_documents(["a", "b"]);
        assert!(filter.allows("a"));
        assert!(filter.allows("b"));
        assert!(!filter.allows("c"));
    }
}
