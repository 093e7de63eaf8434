//! Incremental BM25 inverted index
//!
//! Postings, chunk lengths and corpus aggregates live behind one
//! readers-writer lock. Every mutation tokenizes outside the lock and then
//! applies its whole change under a single write guard, so searches observe
//! either the state before an `add`/`remove` or the state after it.

use crate::error::{QuarryError, Result};
use crate::index::checkpoint::{self, CorpusStats, IndexCheckpoint, CHECKPOINT_VERSION};
use crate::index::{Chunk, Tokenizer};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// BM25 free parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bm25Params {
    /// Term frequency saturation
    pub k1: f32,
    /// Length normalization strength
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// A lexical search hit
#[derive(Debug, Clone, PartialEq)]
pub struct LexicalHit {
    pub chunk_id: String,
    pub score: f32,
}

#[derive(Debug, Default)]
struct IndexState {
    /// term -> chunk id -> term frequency
    postings: AHashMap<String, AHashMap<String, u32>>,
    /// chunk id -> token count
    chunk_lengths: AHashMap<String, u32>,
    /// chunk id -> distinct terms indexed for it
    chunk_terms: AHashMap<String, Vec<String>>,
    /// chunk id -> owning document id
    chunk_documents: AHashMap<String, String>,
    total_length: u64,
    generation: u64,
}

impl IndexState {
    fn avg_chunk_length(&self) -> f64 {
        if self.chunk_lengths.is_empty() {
            0.0
        } else {
            self.total_length as f64 / self.chunk_lengths.len() as f64
        }
    }

    fn insert(
        &mut self,
        chunk_id: &str,
        document_id: &str,
        length: u32,
        freqs: BTreeMap<String, u32>,
    ) {
        let mut terms = Vec::with_capacity(freqs.len());
        for (term, tf) in freqs {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(chunk_id.to_string(), tf);
            terms.push(term);
        }
        self.chunk_lengths.insert(chunk_id.to_string(), length);
        self.chunk_terms.insert(chunk_id.to_string(), terms);
        self.chunk_documents
            .insert(chunk_id.to_string(), document_id.to_string());
        self.total_length += u64::from(length);
    }

    fn remove(&mut self, chunk_id: &str) -> bool {
        let Some(length) = self.chunk_lengths.remove(chunk_id) else {
            return false;
        };
        for term in self.chunk_terms.remove(chunk_id).unwrap_or_default() {
            if let Some(chunks) = self.postings.get_mut(&term) {
                chunks.remove(chunk_id);
                if chunks.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
        self.chunk_documents.remove(chunk_id);
        self.total_length -= u64::from(length);
        true
    }

    fn to_checkpoint(&self, params: Bm25Params, tokenizer: Tokenizer) -> IndexCheckpoint {
        let postings: BTreeMap<String, BTreeMap<String, u32>> = self
            .postings
            .iter()
            .map(|(term, chunks)| {
                let chunks = chunks.iter().map(|(id, tf)| (id.clone(), *tf)).collect();
                (term.clone(), chunks)
            })
            .collect();
        let term_document_frequency = postings
            .iter()
            .map(|(term, chunks)| (term.clone(), chunks.len()))
            .collect();

        IndexCheckpoint {
            version: CHECKPOINT_VERSION,
            corpus_stats: CorpusStats {
                total_chunks: self.chunk_lengths.len(),
                avg_chunk_length: self.avg_chunk_length(),
            },
            params,
            tokenizer,
            chunk_lengths: self
                .chunk_lengths
                .iter()
                .map(|(id, len)| (id.clone(), *len))
                .collect(),
            postings,
            term_document_frequency,
            chunk_documents: self
                .chunk_documents
                .iter()
                .map(|(id, doc)| (id.clone(), doc.clone()))
                .collect(),
        }
    }

    fn from_checkpoint(checkpoint: IndexCheckpoint) -> Self {
        let mut state = IndexState::default();

        for (term, chunks) in checkpoint.postings {
            for chunk_id in chunks.keys() {
                state
                    .chunk_terms
                    .entry(chunk_id.clone())
                    .or_default()
                    .push(term.clone());
            }
            state.postings.insert(term, chunks.into_iter().collect());
        }

        for (chunk_id, length) in checkpoint.chunk_lengths {
            state.total_length += u64::from(length);
            state.chunk_terms.entry(chunk_id.clone()).or_default();
            state.chunk_lengths.insert(chunk_id, length);
        }

        state.chunk_documents = checkpoint.chunk_documents.into_iter().collect();
        state
    }
}

/// Inverted index with exact BM25 scoring and checkpointing.
///
/// Share it behind an `Arc`; all methods take `&self`.
#[derive(Debug)]
pub struct Bm25Index {
    params: Bm25Params,
    tokenizer: Tokenizer,
    state: RwLock<IndexState>,
}

impl Default for Bm25Index {
    fn default() -> Self {
        Self::new(Bm25Params::default(), Tokenizer::default())
    }
}

impl Bm25Index {
    /// Create an empty index
    pub fn new(params: Bm25Params, tokenizer: Tokenizer) -> Self {
        Self {
            params,
            tokenizer,
            state: RwLock::new(IndexState::default()),
        }
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Index a chunk. Re-adding a known id replaces its previous statistics.
    pub fn add(&self, chunk: &Chunk) {
        let tokens = self.tokenizer.tokenize(&chunk.text);
        let length = u32::try_from(tokens.len()).unwrap_or(u32::MAX);
        let mut freqs: BTreeMap<String, u32> = BTreeMap::new();
        for token in tokens {
            *freqs.entry(token).or_insert(0) += 1;
        }

        let mut state = self.write();
        let replaced = state.remove(&chunk.id);
        state.insert(&chunk.id, &chunk.document_id, length, freqs);
        state.generation += 1;

        debug!(
            chunk_id = %chunk.id,
            length,
            replaced,
            "indexed chunk"
        );
    }

    /// Index several chunks
    pub fn add_batch<'a>(&self, chunks: impl IntoIterator<Item = &'a Chunk>) -> usize {
        let mut count = 0;
        for chunk in chunks {
            self.add(chunk);
            count += 1;
        }
        count
    }

    /// Retire a chunk. Returns false if the id was not indexed.
    pub fn remove(&self, chunk_id: &str) -> bool {
        let mut state = self.write();
        let removed = state.remove(chunk_id);
        if removed {
            state.generation += 1;
            debug!(chunk_id, "removed chunk");
        }
        removed
    }

    /// Retire every chunk belonging to a document. Returns how many were removed.
    pub fn remove_document(&self, document_id: &str) -> usize {
        let mut state = self.write();
        let chunk_ids: Vec<String> = state
            .chunk_documents
            .iter()
            .filter(|(_, doc)| doc.as_str() == document_id)
            .map(|(id, _)| id.clone())
            .collect();

        let removed = chunk_ids.iter().filter(|id| state.remove(id)).count();
        if removed > 0 {
            state.generation += 1;
            debug!(document_id, removed, "removed document chunks");
        }
        removed
    }

    /// Top-k chunks by BM25 score, highest first; ties go to the smaller chunk id
    pub fn search(&self, query: &str, k: usize) -> Vec<LexicalHit> {
        if k == 0 {
            return Vec::new();
        }

        let terms: BTreeSet<String> = self.tokenizer.tokenize(query).into_iter().collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let state = self.read();
        let total_chunks = state.chunk_lengths.len() as f64;
        if total_chunks == 0.0 {
            return Vec::new();
        }

        let avg_len = state.avg_chunk_length();
        let avg_len = if avg_len > 0.0 { avg_len } else { 1.0 };
        let k1 = f64::from(self.params.k1);
        let b = f64::from(self.params.b);

        let mut scores: AHashMap<&str, f64> = AHashMap::new();
        for term in &terms {
            let Some(chunks) = state.postings.get(term) else {
                continue;
            };
            let df = chunks.len() as f64;
            let idf = ((total_chunks - df + 0.5) / (df + 0.5) + 1.0).ln();

            for (chunk_id, tf) in chunks {
                let tf = f64::from(*tf);
                let len = state
                    .chunk_lengths
                    .get(chunk_id)
                    .copied()
                    .map(f64::from)
                    .unwrap_or(avg_len);
                let norm = k1 * (1.0 - b + b * len / avg_len);
                *scores.entry(chunk_id.as_str()).or_insert(0.0) += idf * (tf * (k1 + 1.0)) / (tf + norm);
            }
        }

        // Rank on the reported f32 score so equal-looking scores follow the id order
        let mut ranked: Vec<(&str, f32)> = scores
            .into_iter()
            .map(|(chunk_id, score)| (chunk_id, score as f32))
            .collect();
        ranked.sort_by(|x, y| y.1.total_cmp(&x.1).then_with(|| x.0.cmp(y.0)));
        ranked.truncate(k);

        ranked
            .into_iter()
            .map(|(chunk_id, score)| LexicalHit {
                chunk_id: chunk_id.to_string(),
                score,
            })
            .collect()
    }

    /// Persist the full index state atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        let state = self.write();
        let checkpoint = state.to_checkpoint(self.params, self.tokenizer);
        checkpoint::write_checkpoint(path, &checkpoint)?;

        info!(
            "Saved BM25 checkpoint: {} chunks, {} terms -> {}",
            checkpoint.corpus_stats.total_chunks,
            checkpoint.postings.len(),
            path.display()
        );
        Ok(())
    }

    /// Load an index from a checkpoint, adopting its BM25 parameters and
    /// tokenizer settings
    pub fn load(path: &Path) -> Result<Self> {
        let checkpoint = checkpoint::read_checkpoint(path)?;
        let params = checkpoint.params;
        let tokenizer = checkpoint.tokenizer;
        let state = IndexState::from_checkpoint(checkpoint);

        info!(
            "Loaded BM25 checkpoint: {} chunks, {} terms from {}",
            state.chunk_lengths.len(),
            state.postings.len(),
            path.display()
        );

        Ok(Self {
            params,
            tokenizer,
            state: RwLock::new(state),
        })
    }

    /// Replace this index's contents with a checkpoint's.
    ///
    /// The checkpoint must have been written with the same parameters and
    /// tokenizer settings; otherwise its scores would not be reproducible here.
    pub fn restore(&self, path: &Path) -> Result<()> {
        let checkpoint = checkpoint::read_checkpoint(path)?;
        if checkpoint.params != self.params || checkpoint.tokenizer != self.tokenizer {
            return Err(QuarryError::IndexCorruption {
                path: path.to_path_buf(),
                reason: "checkpoint scoring settings differ from this index".to_string(),
            });
        }

        let fresh = IndexState::from_checkpoint(checkpoint);
        let mut state = self.write();
        let generation = state.generation + 1;
        *state = fresh;
        state.generation = generation;
        Ok(())
    }

    /// Load the checkpoint at `path`, or rebuild from `chunks` if it is
    /// missing, corrupt, or from an unsupported version. A rebuilt index is
    /// saved back to `path`.
    pub fn load_or_rebuild<'a>(
        path: &Path,
        params: Bm25Params,
        tokenizer: Tokenizer,
        chunks: impl IntoIterator<Item = &'a Chunk>,
    ) -> Result<Self> {
        match Self::load(path) {
            Ok(index) => Ok(index),
            Err(e) if e.is_recoverable_checkpoint_error() => {
                warn!("Rebuilding BM25 index from source chunks: {}", e);
                let index = Self::new(params, tokenizer);
                let count = index.add_batch(chunks);
                index.save(path)?;
                info!("Rebuilt BM25 index with {} chunks", count);
                Ok(index)
            }
            Err(e) => Err(e),
        }
    }

    /// Corpus-level statistics
    pub fn stats(&self) -> CorpusStats {
        let state = self.read();
        CorpusStats {
            total_chunks: state.chunk_lengths.len(),
            avg_chunk_length: state.avg_chunk_length(),
        }
    }

    /// Number of indexed chunks
    pub fn len(&self) -> usize {
        self.read().chunk_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.read().chunk_lengths.contains_key(chunk_id)
    }

    /// Number of distinct indexed terms
    pub fn term_count(&self) -> usize {
        self.read().postings.len()
    }

    /// Number of chunks containing `term` (already normalized)
    pub fn document_frequency(&self, term: &str) -> usize {
        self.read().postings.get(term).map_or(0, |c| c.len())
    }

    /// Postings for a normalized term, ordered by chunk id
    pub fn postings(&self, term: &str) -> BTreeMap<String, u32> {
        self.read()
            .postings
            .get(term)
            .map(|chunks| chunks.iter().map(|(id, tf)| (id.clone(), *tf)).collect())
            .unwrap_or_default()
    }

    /// Whether any posting list still references `chunk_id`
    pub fn references(&self, chunk_id: &str) -> bool {
        self.read()
            .postings
            .values()
            .any(|chunks| chunks.contains_key(chunk_id))
    }

    /// Monotonic counter bumped by every mutation
    pub fn generation(&self) -> u64 {
        self.read().generation
    }
}
