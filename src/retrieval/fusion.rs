//! Reciprocal Rank Fusion algorithm for combining search results

use ahash::AHashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    #[error("Invalid lexical weight {0}: must be within 0.0..=1.0")]
    InvalidWeight(f32),

    #[error("Invalid RRF constant {0}: must be a positive number")]
    InvalidConstant(f32),
}

/// Configuration for fusion algorithm
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionConfig {
    /// RRF smoothing constant K (typically 60)
    k_constant: f32,
    /// Weight for lexical ranks; vector ranks get the remainder
    weight_lexical: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            k_constant: 60.0,
            weight_lexical: 0.5,
        }
    }
}

impl FusionConfig {
    pub fn new(k_constant: f32, weight_lexical: f32) -> Result<Self, FusionError> {
        if !k_constant.is_finite() || k_constant <= 0.0 {
            return Err(FusionError::InvalidConstant(k_constant));
        }
        if !(0.0..=1.0).contains(&weight_lexical) {
            return Err(FusionError::InvalidWeight(weight_lexical));
        }

        Ok(Self {
            k_constant,
            weight_lexical,
        })
    }

    pub fn k_constant(&self) -> f32 {
        self.k_constant
    }

    pub fn weight_lexical(&self) -> f32 {
        self.weight_lexical
    }

    pub fn weight_vector(&self) -> f32 {
        1.0 - self.weight_lexical
    }
}

/// A candidate after fusion, carrying the sub-search scores it came from
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub chunk_id: String,
    pub lexical_score: Option<f32>,
    pub vector_score: Option<f32>,
    pub fused_score: f32,
}

#[derive(Default)]
struct Accumulator {
    lexical_score: Option<f32>,
    vector_score: Option<f32>,
    fused: f64,
}

/// Apply Reciprocal Rank Fusion to combine a lexical and a vector ranking
///
/// RRF formula: score(id) = w_lex / (K + rank_lex) + w_vec / (K + rank_vec)
///
/// Ranks are 1-based positions in each list. An id absent from a list gets no
/// contribution from it, and an id repeated within one list keeps its first
/// position. Only ranks matter; the input scores are carried through
/// untouched for reporting.
///
/// # Returns
/// Every distinct id from either list, sorted by fused score descending with
/// ties going to the smaller id
pub fn fuse(
    lexical: &[(String, f32)],
    vector: &[(String, f32)],
    config: &FusionConfig,
) -> Vec<FusedCandidate> {
    let k = f64::from(config.k_constant);
    let w_lex = f64::from(config.weight_lexical);
    let w_vec = f64::from(config.weight_vector());

    let mut scores: AHashMap<&str, Accumulator> = AHashMap::new();

    for (rank, (chunk_id, score)) in lexical.iter().enumerate() {
        let entry = scores.entry(chunk_id.as_str()).or_default();
        if entry.lexical_score.is_none() {
            entry.lexical_score = Some(*score);
            entry.fused += w_lex / (k + rank as f64 + 1.0);
        }
    }

    for (rank, (chunk_id, score)) in vector.iter().enumerate() {
        let entry = scores.entry(chunk_id.as_str()).or_default();
        if entry.vector_score.is_none() {
            entry.vector_score = Some(*score);
            entry.fused += w_vec / (k + rank as f64 + 1.0);
        }
    }

    // Sort on the f32 that callers see, so equal fused scores follow the id order
    let mut results: Vec<FusedCandidate> = scores
        .into_iter()
        .map(|(chunk_id, acc)| FusedCandidate {
            chunk_id: chunk_id.to_string(),
            lexical_score: acc.lexical_score,
            vector_score: acc.vector_score,
            fused_score: acc.fused as f32,
        })
        .collect();
    results.sort_by(|x, y| {
        y.fused_score
            .total_cmp(&x.fused_score)
            .then_with(|| x.chunk_id.cmp(&y.chunk_id))
    });
    results
}
