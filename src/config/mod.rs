//! Configuration management for Quarry
//!
//! Every recognised option is an explicit field with a default. Files are TOML,
//! environment variables of the form `QUARRY_SECTION__KEY` override file values,
//! and the result is validated before use.

use crate::error::{QuarryError, Result};
use crate::retrieval::RetrievalMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod validator;

pub use validator::ConfigValidator;

/// Current configuration schema version
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub storage: StorageConfig,
    pub retrieval: RetrievalConfig,
    pub bm25: Bm25Config,
    pub fusion: FusionSettings,
    pub cache: CacheConfig,
    pub session: SessionConfig,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    pub schema_version: String,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }
}

/// Where the index checkpoint and disk cache live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.quarry"),
        }
    }
}

/// Query path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Default retrieval mode
    pub mode: RetrievalMode,
    /// Minimum number of candidates requested from each sub-search
    pub overfetch: usize,
    /// Deadline for the vector sub-search, in milliseconds
    pub vector_timeout_ms: u64,
    /// Retries for transient I/O (vector adapter, disk cache)
    pub retry_attempts: u32,
    /// Base backoff between retries, doubled per attempt
    pub retry_backoff_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::Hybrid,
            overfetch: 50,
            vector_timeout_ms: 2000,
            retry_attempts: 2,
            retry_backoff_ms: 100,
        }
    }
}

/// BM25 scoring and tokenization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Bm25Config {
    pub k1: f32,
    pub b: f32,
    pub remove_stopwords: bool,
    pub min_token_len: usize,
}

impl Default for Bm25Config {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            remove_stopwords: false,
            min_token_len: 1,
        }
    }
}

/// Reciprocal Rank Fusion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionSettings {
    /// Weight of the lexical ranking; the vector ranking gets `1 - weight_lexical`
    pub weight_lexical: f32,
    /// RRF smoothing constant
    pub k_constant: f32,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            weight_lexical: 0.5,
            k_constant: 60.0,
        }
    }
}

/// Result cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub l1_capacity: usize,
    pub l2_enabled: bool,
    pub l2_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            l1_capacity: 1024,
            l2_enabled: true,
            l2_capacity: 50_000,
        }
    }
}

/// Session lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_timeout_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 1800,
            sweep_interval_seconds: 60,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(QuarryError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| QuarryError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| QuarryError::Io {
                source: e,
                context: format!("Failed to create config directory: {:?}", parent),
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| QuarryError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: QUARRY_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix("QUARRY_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "STORAGE__DATA_DIR" => self.storage.data_dir = PathBuf::from(value),
            "RETRIEVAL__MODE" => {
                self.retrieval.mode =
                    value
                        .parse()
                        .map_err(|e: String| QuarryError::InvalidConfigValue {
                            path: path.to_string(),
                            message: e,
                        })?
            }
            "RETRIEVAL__OVERFETCH" => self.retrieval.overfetch = parse_env(path, value)?,
            "RETRIEVAL__VECTOR_TIMEOUT_MS" => {
                self.retrieval.vector_timeout_ms = parse_env(path, value)?
            }
            "RETRIEVAL__RETRY_ATTEMPTS" => self.retrieval.retry_attempts = parse_env(path, value)?,
            "RETRIEVAL__RETRY_BACKOFF_MS" => {
                self.retrieval.retry_backoff_ms = parse_env(path, value)?
            }
            "BM25__K1" => self.bm25.k1 = parse_env(path, value)?,
            "BM25__B" => self.bm25.b = parse_env(path, value)?,
            "BM25__REMOVE_STOPWORDS" => self.bm25.remove_stopwords = parse_env(path, value)?,
            "BM25__MIN_TOKEN_LEN" => self.bm25.min_token_len = parse_env(path, value)?,
            "FUSION__WEIGHT_LEXICAL" => self.fusion.weight_lexical = parse_env(path, value)?,
            "FUSION__K_CONSTANT" => self.fusion.k_constant = parse_env(path, value)?,
            "CACHE__TTL_SECONDS" => self.cache.ttl_seconds = parse_env(path, value)?,
            "CACHE__L1_CAPACITY" => self.cache.l1_capacity = parse_env(path, value)?,
            "CACHE__L2_ENABLED" => self.cache.l2_enabled = parse_env(path, value)?,
            "CACHE__L2_CAPACITY" => self.cache.l2_capacity = parse_env(path, value)?,
            "SESSION__IDLE_TIMEOUT_SECONDS" => {
                self.session.idle_timeout_seconds = parse_env(path, value)?
            }
            "SESSION__SWEEP_INTERVAL_SECONDS" => {
                self.session.sweep_interval_seconds = parse_env(path, value)?
            }
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| QuarryError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("quarry").join("config.toml"))
    }

    /// Data directory with a leading `~` expanded
    pub fn data_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
    }

    /// Path of the BM25 index checkpoint
    pub fn checkpoint_path(&self) -> PathBuf {
        self.data_dir().join("index").join("bm25.json")
    }

    /// Path of the disk-backed result cache
    pub fn cache_db_path(&self) -> PathBuf {
        self.data_dir().join("cache").join("l2.sqlite")
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_seconds)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session.idle_timeout_seconds)
    }

    pub fn vector_timeout(&self) -> Duration {
        Duration::from_millis(self.retrieval.vector_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session.sweep_interval_seconds)
    }
}

fn parse_env<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| QuarryError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}'", value),
    })
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
