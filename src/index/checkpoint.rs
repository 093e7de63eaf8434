//! On-disk snapshot of the BM25 index
//!
//! A checkpoint is a single JSON document holding everything needed to score
//! queries: postings, chunk lengths, corpus statistics, BM25 parameters and
//! tokenizer settings. Unknown fields are ignored on load; an unknown
//! `version` is rejected before any other field is interpreted.

use crate::error::{QuarryError, Result};
use crate::index::{Bm25Params, Tokenizer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Checkpoint format version written by this build
pub const CHECKPOINT_VERSION: u32 = 1;

/// Corpus-level statistics used by BM25 scoring
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorpusStats {
    pub total_chunks: usize,
    pub avg_chunk_length: f64,
}

/// Serialized form of the full index state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexCheckpoint {
    pub version: u32,
    pub corpus_stats: CorpusStats,
    #[serde(default)]
    pub params: Bm25Params,
    #[serde(default)]
    pub tokenizer: Tokenizer,
    pub chunk_lengths: BTreeMap<String, u32>,
    pub postings: BTreeMap<String, BTreeMap<String, u32>>,
    pub term_document_frequency: BTreeMap<String, usize>,
    #[serde(default)]
    pub chunk_documents: BTreeMap<String, String>,
}

impl IndexCheckpoint {
    /// Cross-check the redundant parts of the snapshot against each other
    pub fn verify(&self, path: &Path) -> Result<()> {
        let corrupt = |reason: String| QuarryError::IndexCorruption {
            path: path.to_path_buf(),
            reason,
        };

        if self.corpus_stats.total_chunks != self.chunk_lengths.len() {
            return Err(corrupt(format!(
                "total_chunks is {} but {} chunk lengths are recorded",
                self.corpus_stats.total_chunks,
                self.chunk_lengths.len()
            )));
        }

        if self.term_document_frequency.len() != self.postings.len() {
            return Err(corrupt(format!(
                "{} document frequencies for {} posting lists",
                self.term_document_frequency.len(),
                self.postings.len()
            )));
        }

        for (term, chunks) in &self.postings {
            if chunks.is_empty() {
                return Err(corrupt(format!("empty posting list for term '{}'", term)));
            }

            let df = self.term_document_frequency.get(term).copied();
            if df != Some(chunks.len()) {
                return Err(corrupt(format!(
                    "document frequency for '{}' is {:?}, postings hold {}",
                    term,
                    df,
                    chunks.len()
                )));
            }

            for (chunk_id, tf) in chunks {
                if *tf == 0 {
                    return Err(corrupt(format!(
                        "zero term frequency for '{}' in chunk {}",
                        term, chunk_id
                    )));
                }
                if !self.chunk_lengths.contains_key(chunk_id) {
                    return Err(corrupt(format!(
                        "posting for '{}' references unknown chunk {}",
                        term, chunk_id
                    )));
                }
            }
        }

        let k1 = self.params.k1;
        let b = self.params.b;
        if !k1.is_finite() || k1 <= 0.0 || !(0.0..=1.0).contains(&b) {
            return Err(corrupt(format!("invalid BM25 parameters k1={} b={}", k1, b)));
        }

        Ok(())
    }
}

/// Read and verify a checkpoint file
pub fn read_checkpoint(path: &Path) -> Result<IndexCheckpoint> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(QuarryError::CheckpointNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => {
            return Err(QuarryError::IndexCorruption {
                path: path.to_path_buf(),
                reason: format!("unreadable: {}", e),
            })
        }
    };

    let value: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|e| QuarryError::IndexCorruption {
            path: path.to_path_buf(),
            reason: format!("not valid JSON: {}", e),
        })?;

    let version = value
        .get("version")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| QuarryError::IndexCorruption {
            path: path.to_path_buf(),
            reason: "missing or non-numeric version".to_string(),
        })?;

    if version != u64::from(CHECKPOINT_VERSION) {
        return Err(QuarryError::UnsupportedCheckpointVersion {
            path: path.to_path_buf(),
            found: version,
            supported: CHECKPOINT_VERSION,
        });
    }

    let checkpoint: IndexCheckpoint =
        serde_json::from_value(value).map_err(|e| QuarryError::IndexCorruption {
            path: path.to_path_buf(),
            reason: format!("schema mismatch: {}", e),
        })?;

    checkpoint.verify(path)?;
    Ok(checkpoint)
}

/// Serialize a checkpoint and atomically replace the file at `path`
pub fn write_checkpoint(path: &Path, checkpoint: &IndexCheckpoint) -> Result<()> {
    let bytes = serde_json::to_vec(checkpoint).map_err(|e| QuarryError::Json {
        source: e,
        context: "Failed to serialize index checkpoint".to_string(),
    })?;
    write_atomic(path, &bytes)
}

/// Write to a temporary sibling, sync, then rename over the target so a
/// crash mid-write leaves the previous file intact
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent).map_err(|e| QuarryError::Io {
        source: e,
        context: format!("Failed to create checkpoint directory: {}", parent.display()),
    })?;

    let temp_path = temp_path(path);
    let mut file = fs::File::create(&temp_path).map_err(|e| QuarryError::Io {
        source: e,
        context: format!("Failed to create temp checkpoint: {}", temp_path.display()),
    })?;
    file.write_all(bytes).map_err(|e| QuarryError::Io {
        source: e,
        context: format!("Failed to write temp checkpoint: {}", temp_path.display()),
    })?;
    file.sync_all().map_err(|e| QuarryError::Io {
        source: e,
        context: format!("Failed to sync temp checkpoint: {}", temp_path.display()),
    })?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| QuarryError::Io {
        source: e,
        context: format!(
            "Failed to rename temp checkpoint into place: {} -> {}",
            temp_path.display(),
            path.display()
        ),
    })?;

    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
