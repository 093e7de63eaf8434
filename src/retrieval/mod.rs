//! Hybrid retrieval
//!
//! Lexical (BM25) and vector rankings are merged with Reciprocal Rank Fusion
//! and cached per session by [`HybridRetriever`].

mod fusion;
mod hybrid;

pub use fusion::{fuse, FusedCandidate, FusionConfig, FusionError};
pub use hybrid::{HybridRetriever, Retrieval, RetrievalSource, RetrieveOptions};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which sub-searches a retrieval runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    /// Lexical and vector search, fused
    Hybrid,
    /// Lexical search only
    Bm25,
    /// Vector search only
    Vector,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::Bm25 => "bm25",
            Self::Vector => "vector",
        }
    }

    pub fn uses_lexical(&self) -> bool {
        matches!(self, Self::Hybrid | Self::Bm25)
    }

    pub fn uses_vector(&self) -> bool {
        matches!(self, Self::Hybrid | Self::Vector)
    }
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetrievalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hybrid" => Ok(Self::Hybrid),
            "bm25" | "bm25-only" => Ok(Self::Bm25),
            "vector" | "vector-only" => Ok(Self::Vector),
            other => Err(format!(
                "Unknown retrieval mode '{}' (expected hybrid, bm25 or vector)",
                other
            )),
        }
    }
}

/// One ranked retrieval result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    /// BM25 score, if the chunk came up in lexical search
    pub lexical_score: Option<f32>,
    /// Similarity, if the chunk came up in vector search
    pub vector_score: Option<f32>,
    pub fused_score: f32,
    /// 1-based position in the final ranking
    pub rank: usize,
}
