use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Quarry
#[derive(Error, Debug)]
pub enum QuarryError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// No checkpoint exists at the given path
    #[error("Index checkpoint not found: {path}")]
    CheckpointNotFound { path: PathBuf },

    /// Checkpoint could not be read, parsed, or is internally inconsistent
    #[error("Index checkpoint is corrupted ({path}): {reason}")]
    IndexCorruption { path: PathBuf, reason: String },

    /// Checkpoint was written by an incompatible format version
    #[error("Unsupported checkpoint version {found} in {path} (supported: {supported})")]
    UnsupportedCheckpointVersion {
        path: PathBuf,
        found: u64,
        supported: u32,
    },

    /// Vector search adapter or embedder failed
    #[error("Vector index unavailable: {0}")]
    IndexUnavailable(String),

    /// Rejected query input
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Disk cache failure
    #[error("Cache I/O error: {context}: {reason}")]
    CacheIo { context: String, reason: String },

    /// Session not found
    #[error("Session not found: {id}")]
    SessionNotFound { id: String },

    /// Session exceeded its idle timeout
    #[error("Session expired: {id}")]
    SessionExpired { id: String },

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Fusion configuration errors
    #[error("Fusion error: {0}")]
    Fusion(#[from] crate::retrieval::FusionError),

    /// Vector index errors surfaced from direct adapter use
    #[error("Vector index error: {0}")]
    VectorIndex(#[from] crate::embedding::VectorIndexError),

    /// Embedding errors surfaced from direct embedder use
    #[error("Embedding error: {0}")]
    Embedding(#[from] crate::embedding::EmbeddingError),
}

impl QuarryError {
    /// Build a cache I/O error from any displayable failure
    pub fn cache_io(context: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::CacheIo {
            context: context.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether a checkpoint load failed in a way a rebuild from source can fix
    pub fn is_recoverable_checkpoint_error(&self) -> bool {
        matches!(
            self,
            Self::CheckpointNotFound { .. }
                | Self::IndexCorruption { .. }
                | Self::UnsupportedCheckpointVersion { .. }
        )
    }
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for Quarry operations
pub type Result<T> = std::result::Result<T, QuarryError>;
