/// HNSW-backed implementation of the vector search contract
use super::search::{VectorFilter, VectorHit, VectorQuery, VectorSearch};
use super::{Embedder, EmbeddingError};
use crate::index::Chunk;
use async_trait::async_trait;
use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

/// Upper bound on HNSW layers
const MAX_LAYERS: usize = 16;

#[derive(Error, Debug)]
pub enum VectorIndexError {
    #[error("Index initialization failed: {0}")]
    InitializationError(String),

    #[error("Insert failed: {0}")]
    InsertError(String),

    #[error("Search failed: {0}")]
    SearchError(String),

    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Vector store unavailable: {0}")]
    Unavailable(String),

    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
}

/// Configuration for the HNSW graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Vector dimension (must match embedding dimension)
    pub dimension: usize,
    /// Capacity hint for the graph, counting retired vectors
    pub max_elements: usize,
    /// HNSW M parameter (number of connections per layer)
    pub m: usize,
    /// HNSW construction parameter (higher = better recall, slower build)
    pub ef_construction: usize,
    /// Minimum search breadth
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            max_elements: 100_000,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

#[derive(Debug)]
struct Slot {
    chunk_id: String,
    document_id: String,
}

/// Mapping between string chunk ids and the dense ids HNSW works with.
/// A dense id missing from `slots` is a tombstone.
#[derive(Debug, Default)]
struct Slots {
    next_id: usize,
    by_chunk: HashMap<String, usize>,
    slots: HashMap<usize, Slot>,
}

impl Slots {
    fn retired(&self) -> usize {
        self.next_id - self.slots.len()
    }
}

/// Graph state shared with blocking search tasks
struct Graph {
    index: RwLock<Hnsw<'static, f32, DistCosine>>,
    slots: RwLock<Slots>,
    config: HnswConfig,
}

impl Graph {
    fn check_dimension(&self, vector: &[f32]) -> Result<(), VectorIndexError> {
        if vector.len() != self.config.dimension {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>, VectorIndexError> {
        self.check_dimension(vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        if slots.slots.is_empty() {
            return Ok(Vec::new());
        }

        // A document filter can reject any number of neighbours, so it
        // scans the whole graph
        let fetch = if filter.document_ids.is_some() {
            slots.next_id
        } else {
            (k + slots.retired()).min(slots.next_id)
        };
        let ef = self.config.ef_search.max(fetch);

        let neighbours = self
            .index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .search(vector, fetch, ef);

        let mut hits: Vec<VectorHit> = neighbours
            .into_iter()
            .filter_map(|n| {
                let slot = slots.slots.get(&n.d_id)?;
                filter.allows(&slot.document_id).then(|| VectorHit {
                    chunk_id: slot.chunk_id.clone(),
                    score: 1.0 - n.distance,
                })
            })
            .collect();
        hits.sort_by(|x, y| y.score.total_cmp(&x.score));
        hits.truncate(k);

        debug!(k, fetched = fetch, returned = hits.len(), "vector search");
        Ok(hits)
    }
}

/// In-process vector store over an HNSW graph.
///
/// HNSW has no delete, so retiring a chunk tombstones its graph node and
/// searches over-fetch by the number of tombstones. Re-inserting a chunk id
/// retires the old node and adds a new one.
///
/// Queries through [`VectorSearch`] embed and search on the blocking pool, so
/// a caller's deadline can fire while they run.
pub struct HnswVectorStore {
    graph: Arc<Graph>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl HnswVectorStore {
    pub fn new(config: HnswConfig) -> Result<Self, VectorIndexError> {
        if config.dimension == 0 {
            return Err(VectorIndexError::InitializationError(
                "dimension must be greater than 0".to_string(),
            ));
        }
        if config.m == 0 || config.max_elements == 0 {
            return Err(VectorIndexError::InitializationError(
                "m and max_elements must be greater than 0".to_string(),
            ));
        }

        let index = Hnsw::<f32, DistCosine>::new(
            config.m,
            config.max_elements,
            MAX_LAYERS,
            config.ef_construction,
            DistCosine,
        );

        Ok(Self {
            graph: Arc::new(Graph {
                index: RwLock::new(index),
                slots: RwLock::new(Slots::default()),
                config,
            }),
            embedder: None,
        })
    }

    /// Attach an embedder used for text queries and `insert_chunk`
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Result<Self, VectorIndexError> {
        if embedder.dimension() != self.graph.config.dimension {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.graph.config.dimension,
                actual: embedder.dimension(),
            });
        }
        self.embedder = Some(embedder);
        Ok(self)
    }

    /// Insert or replace the vector for a chunk
    pub fn insert(
        &self,
        chunk_id: &str,
        document_id: &str,
        vector: &[f32],
    ) -> Result<(), VectorIndexError> {
        let graph = &self.graph;
        graph.check_dimension(vector)?;

        let mut slots = graph.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots.next_id >= graph.config.max_elements {
            return Err(VectorIndexError::InsertError(format!(
                "capacity of {} vectors exhausted",
                graph.config.max_elements
            )));
        }

        let id = slots.next_id;
        let data = vector.to_vec();
        graph
            .index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((data.as_slice(), id));

        slots.next_id += 1;
        if let Some(previous) = slots.by_chunk.insert(chunk_id.to_string(), id) {
            slots.slots.remove(&previous);
        }
        slots.slots.insert(
            id,
            Slot {
                chunk_id: chunk_id.to_string(),
                document_id: document_id.to_string(),
            },
        );
        Ok(())
    }

    /// Embed a chunk's text with the attached embedder and insert it
    pub fn insert_chunk(&self, chunk: &Chunk) -> Result<(), VectorIndexError> {
        let embedder = self.require_embedder()?;
        let vector = embedder.embed(&chunk.text)?;
        self.insert(&chunk.id, &chunk.document_id, &vector)
    }

    /// Embed and insert several chunks in one embedder call
    pub fn insert_chunks(&self, chunks: &[Chunk]) -> Result<usize, VectorIndexError> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let embedder = self.require_embedder()?;
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embedder.embed_batch(&texts)?;
        if vectors.len() != chunks.len() {
            return Err(VectorIndexError::InsertError(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }
        for (chunk, vector) in chunks.iter().zip(&vectors) {
            self.insert(&chunk.id, &chunk.document_id, vector)?;
        }
        Ok(chunks.len())
    }

    /// Retire a chunk's vector. Returns false if it was not present.
    pub fn retire(&self, chunk_id: &str) -> bool {
        let mut slots = self.graph.slots.write().unwrap_or_else(PoisonError::into_inner);
        match slots.by_chunk.remove(chunk_id) {
            Some(id) => {
                slots.slots.remove(&id);
                true
            }
            None => false,
        }
    }

    /// Retire every vector belonging to a document
    pub fn retire_document(&self, document_id: &str) -> usize {
        let mut slots = self.graph.slots.write().unwrap_or_else(PoisonError::into_inner);
        let doomed: Vec<(usize, String)> = slots
            .slots
            .iter()
            .filter(|(_, slot)| slot.document_id == document_id)
            .map(|(id, slot)| (*id, slot.chunk_id.clone()))
            .collect();
        for (id, chunk_id) in &doomed {
            slots.slots.remove(id);
            slots.by_chunk.remove(chunk_id);
        }
        doomed.len()
    }

    /// Nearest live chunks to `vector`, most similar first. Runs on the
    /// calling thread.
    pub fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>, VectorIndexError> {
        self.graph.search(vector, k, filter)
    }

    fn require_embedder(&self) -> Result<&Arc<dyn Embedder>, VectorIndexError> {
        self.embedder.as_ref().ok_or_else(|| {
            VectorIndexError::Unavailable("no embedder attached to vector store".to_string())
        })
    }

    /// Number of live vectors
    pub fn len(&self) -> usize {
        self.graph
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.graph
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_chunk
            .contains_key(chunk_id)
    }

    pub fn dimension(&self) -> usize {
        self.graph.config.dimension
    }
}

#[async_trait]
impl VectorSearch for HnswVectorStore {
    async fn query(
        &self,
        query: VectorQuery,
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<VectorHit>, VectorIndexError> {
        let embedder = match &query {
            VectorQuery::Text(_) => Some(Arc::clone(self.require_embedder()?)),
            VectorQuery::Embedding(_) => None,
        };
        let graph = Arc::clone(&self.graph);
        let filter = filter.clone();

        tokio::task::spawn_blocking(move || {
            let vector = match (query, embedder) {
                (VectorQuery::Embedding(vector), _) => vector,
                (VectorQuery::Text(text), Some(embedder)) => embedder.embed(&text)?,
                (VectorQuery::Text(_), None) => {
                    return Err(VectorIndexError::Unavailable(
                        "no embedder attached to vector store".to_string(),
                    ))
                }
            };
            graph.search(&vector, k, &filter)
        })
        .await
        .map_err(|e| VectorIndexError::SearchError(format!("search task failed: {}", e)))?
    }
}
