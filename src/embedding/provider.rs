/// Embedder capability and the optional FastEmbed implementation
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitializationError(String),

    #[error("Embedding generation failed: {0}")]
    GenerationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Turns text into dense vectors.
///
/// Implementations are external collaborators (local models, remote APIs);
/// the retrieval core only calls through this trait.
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Generate embeddings for multiple texts
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;
}

#[cfg(feature = "fastembed")]
pub use local::FastEmbedEmbedder;

#[cfg(feature = "fastembed")]
mod local {
    use super::{Embedder, EmbeddingError};
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::sync::Arc;

    /// Local embedding generation through fastembed (ONNX runtime).
    ///
    /// Models are downloaded to the Hugging Face cache on first use.
    pub struct FastEmbedEmbedder {
        model: Arc<TextEmbedding>,
        model_name: String,
        dimension: usize,
    }

    impl FastEmbedEmbedder {
        pub fn new(model_name: &str) -> Result<Self, EmbeddingError> {
            let (embedding_model, dimension) = match model_name {
                "all-MiniLM-L6-v2" | "all-minilm-l6-v2" => (EmbeddingModel::AllMiniLML6V2, 384),
                "bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384),
                "bge-base-en-v1.5" => (EmbeddingModel::BGEBaseENV15, 768),
                _ => {
                    return Err(EmbeddingError::InitializationError(format!(
                        "Unsupported model: {}. Supported: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5",
                        model_name
                    )));
                }
            };

            tracing::info!(
                "Initializing embedding model: {} ({}D)",
                model_name,
                dimension
            );

            let init_options = InitOptions::new(embedding_model).with_show_download_progress(true);
            let model = TextEmbedding::try_new(init_options)
                .map_err(|e| EmbeddingError::InitializationError(e.to_string()))?;

            Ok(Self {
                model: Arc::new(model),
                model_name: model_name.to_string(),
                dimension,
            })
        }

        pub fn with_default_model() -> Result<Self, EmbeddingError> {
            Self::new("all-MiniLM-L6-v2")
        }

        fn check_dimension(&self, embedding: &[f32]) -> Result<(), EmbeddingError> {
            if embedding.len() != self.dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dimension,
                    actual: embedding.len(),
                });
            }
            Ok(())
        }
    }

    impl Embedder for FastEmbedEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if text.trim().is_empty() {
                return Err(EmbeddingError::InvalidInput("Empty text".to_string()));
            }

            let embedding = self
                .model
                .embed(vec![text.to_string()], None)
                .map_err(|e| EmbeddingError::GenerationError(e.to_string()))?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    EmbeddingError::GenerationError("No embeddings generated".to_string())
                })?;

            self.check_dimension(&embedding)?;
            Ok(embedding)
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            if texts.iter().any(|t| t.trim().is_empty()) {
                return Err(EmbeddingError::InvalidInput(
                    "Batch contains empty text".to_string(),
                ));
            }

            let embeddings = self
                .model
                .embed(texts.to_vec(), None)
                .map_err(|e| EmbeddingError::GenerationError(e.to_string()))?;

            for embedding in &embeddings {
                self.check_dimension(embedding)?;
            }
            Ok(embeddings)
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn model_name(&self) -> &str {
            &self.model_name
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    struct LengthEmbedder;

    impl Embedder for LengthEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            if text.is_empty() {
                return Err(EmbeddingError::InvalidInput("Empty text".to_string()));
            }
            Ok(vec![text.len() as f32, 1.0])
        }

        fn dimension(&self) -> usize {
            2
        }

        fn model_name(&self) -> &str {
            "length"
        }
    }

    #[test]
    fn test_default_batch_embeds_each_text() {
        let embedder = LengthEmbedder;
        let out = embedder
            .embed_batch(&["a".to_string(), "abc".to_string()])
            .unwrap();
        assert_eq!(out, vec![vec![1.0, 1.0], vec![3.0, 1.0]]);
    }

    #[test]
    fn test_default_batch_propagates_errors() {
        let embedder = LengthEmbedder;
        assert!(embedder
            .embed_batch(&["ok".to_string(), String::new()])
            .is_err());
    }
}
