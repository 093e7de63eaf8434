//! Lexical side of retrieval: tokenizer, BM25 inverted index, checkpoints

mod bm25;
pub mod checkpoint;
mod chunk;
mod tokenizer;

pub use bm25::{Bm25Index, Bm25Params, LexicalHit};
pub use checkpoint::{CorpusStats, IndexCheckpoint, CHECKPOINT_VERSION};
pub use chunk::{Chunk, Document};
pub use tokenizer::{is_stopword, Tokenizer};
