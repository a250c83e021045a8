//! Runtime Configuration
//!
//! Tunables for extraction heuristics, chunking, retrieval and the external
//! collaborators. Loaded from `<data_dir>/tablerag/config/config.json` when
//! present; every field has a default so partial files are fine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::chroma::collections::COLLECTION_DOCUMENT_CHUNKS;
use crate::error::ErrorKind;

/// Directory name under the platform data dir
pub const APP_IDENTIFIER: &str = "tablerag";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("App data directory not found")]
    NoAppDataDir,
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Serialize for ConfigError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl ErrorKind for ConfigError {
    fn kind(&self) -> &'static str {
        "ConfigError"
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RagConfig {
    pub chunking: ChunkingConfig,
    pub tables: TableHeuristics,
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
}

/// Chunk size and overlap, in characters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
    /// Multiple of `chunk_size` a table chunk may reach before it is logged as oversized
    pub table_tolerance: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 200,
            table_tolerance: 1.5,
        }
    }
}

/// Table inference heuristics. These are unvalidated guesses, tune freely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TableHeuristics {
    /// Characters of preceding text scanned for a caption
    pub caption_scan_chars: usize,
    /// Minimum share of non-empty cells for a header row
    pub header_fill_ratio: f64,
    /// Header cells must average fewer characters than this
    pub header_max_avg_len: f64,
    /// Share of numeric values above which a column is right-aligned
    pub numeric_ratio: f64,
    /// Minimum rows for a whitespace-aligned table in extracted page text
    pub min_aligned_rows: usize,
}

impl Default for TableHeuristics {
    fn default() -> Self {
        Self {
            caption_scan_chars: 500,
            header_fill_ratio: 0.7,
            header_max_avg_len: 25.0,
            numeric_ratio: 0.7,
            min_aligned_rows: 3,
        }
    }
}

/// Query expansion and context assembly
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Search limit used when the query mentions a table
    pub table_query_limit: usize,
    pub requested_table_boost: f32,
    pub table_boost: f32,
    pub query_timeout_ms: u64,
    pub max_context_chunks: usize,
    /// Optional token ceiling for the assembled context (whole chunks only)
    pub max_context_tokens: Option<u32>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            table_query_limit: 10,
            requested_table_boost: 1.5,
            table_boost: 1.2,
            query_timeout_ms: 15_000,
            max_context_chunks: 10,
            max_context_tokens: None,
        }
    }
}

/// Which embedding backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProvider {
    /// Deterministic local feature hashing
    Hashing,
    /// Ollama `/api/embeddings`
    Ollama,
    /// OpenAI-compatible `/embeddings`
    OpenAi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub dimensions: usize,
    pub max_concurrency: usize,
    pub request_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Hashing,
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            api_key: None,
            dimensions: 256,
            max_concurrency: 4,
            request_timeout_secs: 30,
        }
    }
}

/// Which vector index to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexBackend {
    Memory,
    Chroma,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IndexConfig {
    pub backend: IndexBackend,
    pub chroma_url: String,
    pub collection: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackend::Memory,
            chroma_url: "http://127.0.0.1:8000".to_string(),
            collection: COLLECTION_DOCUMENT_CHUNKS.to_string(),
        }
    }
}

impl RagConfig {
    /// Reject combinations the pipeline cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunkSize must be positive".to_string()));
        }
        if self.chunking.overlap >= self.chunking.chunk_size {
            return Err(ConfigError::Invalid(format!(
                "overlap ({}) must be smaller than chunkSize ({})",
                self.chunking.overlap, self.chunking.chunk_size
            )));
        }
        if self.retrieval.top_k == 0 || self.retrieval.table_query_limit == 0 {
            return Err(ConfigError::Invalid("retrieval limits must be positive".to_string()));
        }
        if self.embedding.max_concurrency == 0 {
            return Err(ConfigError::Invalid("maxConcurrency must be positive".to_string()));
        }
        Ok(())
    }

    /// Load from an explicit path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: RagConfig = serde_json::from_str(&content)?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when absent
    pub fn load() -> Result<Self, ConfigError> {
        let path = default_config_path()?;
        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Write as pretty JSON, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// `<data_dir>/tablerag`
pub fn app_data_dir() -> Result<PathBuf, ConfigError> {
    let base = dirs::data_dir().ok_or(ConfigError::NoAppDataDir)?;
    Ok(base.join(APP_IDENTIFIER))
}

/// `<data_dir>/tablerag/config/config.json`
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(app_data_dir()?.join("config").join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RagConfig::default();
        assert_eq!(config.chunking.chunk_size, 1000);
        assert_eq!(config.chunking.overlap, 200);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.table_query_limit, 10);
        assert!((config.retrieval.requested_table_boost - 1.5).abs() < f32::EPSILON);
        assert!((config.retrieval.table_boost - 1.2).abs() < f32::EPSILON);
        assert_eq!(config.index.collection, COLLECTION_DOCUMENT_CHUNKS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let json = r#"{ "chunking": { "chunkSize": 400 }, "index": { "backend": "chroma" } }"#;
        let config: RagConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.chunking.chunk_size, 400);
        assert_eq!(config.chunking.overlap, 200);
        assert_eq!(config.index.backend, IndexBackend::Chroma);
        assert_eq!(config.embedding.provider, EmbeddingProvider::Hashing);
    }

    #[test]
    fn test_validate_rejects_large_overlap() {
        let mut config = RagConfig::default();
        config.chunking.overlap = 1000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("config.json");

        let mut config = RagConfig::default();
        config.retrieval.top_k = 7;
        config.embedding.provider = EmbeddingProvider::Ollama;
        config.save_to(&path).unwrap();

        let loaded = RagConfig::load_from(&path).unwrap();
        assert_eq!(loaded.retrieval.top_k, 7);
        assert_eq!(loaded.embedding.provider, EmbeddingProvider::Ollama);
    }
}
