//! Documents and chunks as seen by the retrieval core

use crate::index::Tokenizer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A source document. Owned by the ingestion pipeline; the index only
/// records which document each chunk came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source_path: PathBuf,
    /// Content hash (BLAKE3, hex) of the source bytes
    pub content_hash: String,
}

impl Document {
    pub fn new(id: impl Into<String>, source_path: impl Into<PathBuf>, content: &[u8]) -> Self {
        Self {
            id: id.into(),
            source_path: source_path.into(),
            content_hash: blake3::hash(content).to_hex().to_string(),
        }
    }
}

/// An indexed unit of text. Immutable once indexed: re-ingestion retires the
/// old chunk id and indexes a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub text: String,
    pub token_count: usize,
    /// Ordered metadata such as page and section
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Chunk {
    /// Create a chunk, counting tokens with the given tokenizer
    pub fn new(
        id: impl Into<String>,
        document_id: impl Into<String>,
        text: impl Into<String>,
        tokenizer: &Tokenizer,
    ) -> Self {
        let text = text.into();
        let token_count = tokenizer.tokenize(&text).len();
        Self {
            id: id.into(),
            document_id: document_id.into(),
            text,
            token_count,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
