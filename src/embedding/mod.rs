//! Vector side of retrieval
//!
//! - `Embedder` turns text into vectors (local model behind the `fastembed` feature)
//! - `VectorSearch` is the async contract the retriever queries
//! - `HnswVectorStore` is an in-process `VectorSearch` over an HNSW graph

mod provider;
mod search;
mod vector_index;

#[cfg(feature = "fastembed")]
pub use provider::FastEmbedEmbedder;
pub use provider::{Embedder, EmbeddingError};
pub use search::{VectorFilter, VectorHit, VectorQuery, VectorSearch};
pub use vector_index::{HnswConfig, HnswVectorStore, VectorIndexError};
