//! Quarry - Hybrid Retrieval & Caching Core
//!
//! A local retrieval engine for document question answering: an incrementally
//! maintained BM25 index with durable checkpoints, a pluggable vector search
//! backend, Reciprocal Rank Fusion of both rankings, and a session-isolated
//! two-tier result cache with TTL expiry.

pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod logging;
pub mod retrieval;
pub mod retry;
pub mod session;

pub use cache::{CacheEntry, CacheHitTier, CacheKey, CacheStats, MultiTierCache};
pub use config::Config;
pub use embedding::{Embedder, VectorFilter, VectorHit, VectorQuery, VectorSearch};
pub use error::{QuarryError, Result};
pub use index::{Bm25Index, Bm25Params, Chunk, Document, Tokenizer};
pub use retrieval::{
    HybridRetriever, Retrieval, RetrievalMode, RetrievalSource, RetrieveOptions, RetrievedChunk,
};
pub use session::{Session, SessionRegistry};
