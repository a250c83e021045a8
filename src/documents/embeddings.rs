//! Embedding Generation
//!
//! `Embedder` is the seam to the embedding model. Two implementations ship:
//! a local feature-hashing embedder (deterministic, no network) and an HTTP
//! client for Ollama or OpenAI-compatible endpoints. `EmbeddingGenerator`
//! adds the per-request timeout and bounded batch concurrency on top.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::error::ErrorKind;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Cannot embed empty text")]
    EmptyInput,
    #[error("Embedding model unavailable: {0}")]
    Unavailable(String),
    #[error("Embedding request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Embedding model error: {0}")]
    Model(String),
    #[error("Invalid embedding response: {0}")]
    InvalidResponse(String),
    #[error("Embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl Serialize for EmbeddingError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl ErrorKind for EmbeddingError {
    fn kind(&self) -> &'static str {
        "EmbeddingError"
    }
}

/// Embedding vector
pub type Embedding = Vec<f32>;

/// Embedding result for a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEmbedding {
    pub chunk_id: String,
    pub vector: Embedding,
    pub generated_at: DateTime<Utc>,
}

/// Text to vector
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError>;

    /// Output width when known up front
    fn dimensions(&self) -> Option<usize>;

    fn model(&self) -> &str;

    /// Check the model with a short input
    async fn health(&self) -> Result<(), EmbeddingError> {
        self.embed("health check").await.map(|_| ())
    }
}

// ============ FEATURE HASHING ============

/// Local embedder using the hashing trick. The same text always produces the
/// same vector regardless of what else has been embedded. Buckets come from
/// SHA-256, so vectors stay stable across builds and can be persisted.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn bucket(&self, token: &str) -> usize {
        let digest = Sha256::digest(token.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(prefix) % self.dimensions as u64) as usize
    }

    /// L2-normalised term frequencies over hashed buckets
    pub fn embed_sync(&self, text: &str) -> Embedding {
        let mut tf = vec![0.0f32; self.dimensions];
        for token in text
            .split_whitespace()
            .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|t| !t.is_empty())
        {
            tf[self.bucket(&token.to_lowercase())] += 1.0;
        }

        let norm: f32 = tf.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut tf {
                *x /= norm;
            }
        }
        tf
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> Option<usize> {
        Some(self.dimensions)
    }

    fn model(&self) -> &str {
        "feature-hashing"
    }

    async fn health(&self) -> Result<(), EmbeddingError> {
        Ok(())
    }
}

// ============ HTTP MODELS ============

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaResponse {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
}

/// Client for an external embedding model
pub struct HttpEmbedder {
    client: reqwest::Client,
    provider: EmbeddingProvider,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let base = config.base_url.trim_end_matches('/');
        let endpoint = match config.provider {
            EmbeddingProvider::Ollama => format!("{}/api/embeddings", base),
            EmbeddingProvider::OpenAi => format!("{}/embeddings", base),
            EmbeddingProvider::Hashing => {
                return Err(EmbeddingError::Model(
                    "hashing provider does not use an HTTP endpoint".to_string(),
                ))
            }
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            provider: config.provider,
            endpoint,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    async fn post<T: Serialize + ?Sized>(&self, body: &T) -> Result<reqwest::Response, EmbeddingError> {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EmbeddingError::Unavailable(format!("request timed out: {}", e))
            } else {
                EmbeddingError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Model(format!("HTTP {}: {}", status, body)));
        }
        Ok(response)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let vector = match self.provider {
            EmbeddingProvider::OpenAi => {
                let response = self
                    .post(&OpenAiRequest {
                        model: &self.model,
                        input: [text],
                    })
                    .await?;
                let parsed: OpenAiResponse = response
                    .json()
                    .await
                    .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
                parsed
                    .data
                    .into_iter()
                    .next()
                    .map(|d| d.embedding)
                    .ok_or_else(|| EmbeddingError::InvalidResponse("no embedding in response".to_string()))?
            }
            _ => {
                let response = self
                    .post(&OllamaRequest {
                        model: &self.model,
                        prompt: text,
                    })
                    .await?;
                let parsed: OllamaResponse = response
                    .json()
                    .await
                    .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
                parsed.embedding
            }
        };

        if vector.is_empty() {
            return Err(EmbeddingError::InvalidResponse("empty embedding".to_string()));
        }
        Ok(vector)
    }

    fn dimensions(&self) -> Option<usize> {
        None
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Build the embedder selected in configuration
pub fn embedder_from_config(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    match config.provider {
        EmbeddingProvider::Hashing => Ok(Arc::new(HashingEmbedder::new(config.dimensions))),
        EmbeddingProvider::Ollama | EmbeddingProvider::OpenAi => Ok(Arc::new(HttpEmbedder::new(config)?)),
    }
}

// ============ GENERATOR ============

/// Timeout and concurrency policy around an `Embedder`
#[derive(Clone)]
pub struct EmbeddingGenerator {
    embedder: Arc<dyn Embedder>,
    timeout: Duration,
    max_concurrency: usize,
}

impl EmbeddingGenerator {
    pub fn new(embedder: Arc<dyn Embedder>, timeout: Duration, max_concurrency: usize) -> Self {
        Self {
            embedder,
            timeout,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn from_config(embedder: Arc<dyn Embedder>, config: &EmbeddingConfig) -> Self {
        Self::new(
            embedder,
            Duration::from_secs(config.request_timeout_secs),
            config.max_concurrency,
        )
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Embed one text under the request timeout
    pub async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        let vector = tokio::time::timeout(self.timeout, self.embedder.embed(text))
            .await
            .map_err(|_| EmbeddingError::Timeout(self.timeout))??;

        if let Some(expected) = self.embedder.dimensions() {
            if vector.len() != expected {
                return Err(EmbeddingError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }
        Ok(vector)
    }

    /// Embed many texts with at most `max_concurrency` requests in flight.
    /// Results keep input order; each item fails on its own.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Embedding, EmbeddingError>> {
        let pending: Vec<_> = texts.iter().map(|text| self.embed(text)).collect();
        stream::iter(pending)
            .buffered(self.max_concurrency)
            .collect()
            .await
    }

    /// Embed `(chunk_id, text)` pairs
    pub async fn embed_chunks(&self, items: &[(String, String)]) -> Vec<Result<ChunkEmbedding, EmbeddingError>> {
        let texts: Vec<String> = items.iter().map(|(_, text)| text.clone()).collect();
        let results = self.embed_batch(&texts).await;

        let mut failures = 0usize;
        let out: Vec<_> = items
            .iter()
            .zip(results)
            .map(|((chunk_id, _), result)| match result {
                Ok(vector) => Ok(ChunkEmbedding {
                    chunk_id: chunk_id.clone(),
                    vector,
                    generated_at: Utc::now(),
                }),
                Err(e) => {
                    failures += 1;
                    warn!(chunk_id = %chunk_id, error = %e, "Chunk embedding failed");
                    Err(e)
                }
            })
            .collect();

        debug!(
            total = items.len(),
            failures,
            model = self.embedder.model(),
            "Embedded chunks"
        );
        out
    }

    pub async fn health(&self) -> Result<(), EmbeddingError> {
        tokio::time::timeout(self.timeout, self.embedder.health())
            .await
            .map_err(|_| EmbeddingError::Timeout(self.timeout))?
    }
}

/// Calculate cosine similarity between two embeddings
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Sleeps on inputs containing "slow", tracks peak concurrency
    struct CountingEmbedder {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl CountingEmbedder {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = if text.contains("slow") { 500 } else { 20 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if text.contains("wide") {
                return Ok(vec![0.5; 8]);
            }
            Ok(vec![1.0, 0.0, 0.0, 0.0])
        }

        fn dimensions(&self) -> Option<usize> {
            Some(4)
        }

        fn model(&self) -> &str {
            "counting"
        }
    }

    /// One-shot HTTP server answering with `body`; returns its base URL
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{}", addr)
    }

    fn http_config(provider: EmbeddingProvider, base_url: String) -> EmbeddingConfig {
        EmbeddingConfig {
            provider,
            base_url,
            model: "test-model".to_string(),
            api_key: Some("secret".to_string()),
            request_timeout_secs: 5,
            ..EmbeddingConfig::default()
        }
    }

    #[test]
    fn test_hashing_embedding_shape_and_norm() {
        let embedder = HashingEmbedder::default();
        let embedding = embedder.embed_sync("Hello world this is a test");
        assert_eq!(embedding.len(), 256);
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_embedding_stability() {
        let embedder = HashingEmbedder::default();
        let emb1 = embedder.embed_sync("The quick brown fox");
        let _ = embedder.embed_sync("completely different words zebra giraffe quantum");
        let emb2 = embedder.embed_sync("The quick brown fox");
        assert_eq!(emb1, emb2);
    }

    #[test]
    fn test_hashing_buckets_are_pinned() {
        // Persisted vectors depend on these exact buckets.
        let embedder = HashingEmbedder::default();
        assert_eq!(embedder.bucket("fox"), 119);
        assert_eq!(embedder.bucket("table"), 13);
        assert_eq!(embedder.bucket("lpddr4"), 7);

        let embedding = embedder.embed_sync("Table");
        assert!((embedding[13] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]) - 1.0).abs() < 0.001);
        assert!(cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]).abs() < 0.001);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let generator = EmbeddingGenerator::new(Arc::new(HashingEmbedder::default()), Duration::from_secs(1), 2);
        assert!(matches!(generator.embed("   ").await, Err(EmbeddingError::EmptyInput)));
    }

    #[tokio::test]
    async fn test_timeout_fails_single_item() {
        let generator = EmbeddingGenerator::new(Arc::new(CountingEmbedder::new()), Duration::from_millis(200), 4);
        let texts = vec!["fast one".to_string(), "slow one".to_string(), "fast two".to_string()];
        let results = generator.embed_batch(&texts).await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(EmbeddingError::Timeout(_))));
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn test_batch_concurrency_is_bounded() {
        let counting = Arc::new(CountingEmbedder::new());
        let generator = EmbeddingGenerator::new(counting.clone(), Duration::from_secs(5), 2);
        let texts: Vec<String> = (0..10).map(|i| format!("text {}", i)).collect();
        let results = generator.embed_batch(&texts).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert!(counting.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let generator = EmbeddingGenerator::new(Arc::new(CountingEmbedder::new()), Duration::from_secs(1), 1);
        let err = generator.embed("too wide").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::DimensionMismatch { expected: 4, actual: 8 }));
    }

    #[tokio::test]
    async fn test_embed_chunks_keeps_ids() {
        let generator = EmbeddingGenerator::new(Arc::new(HashingEmbedder::new(16)), Duration::from_secs(1), 2);
        let items = vec![
            ("doc_0".to_string(), "alpha beta".to_string()),
            ("doc_1".to_string(), "".to_string()),
        ];
        let results = generator.embed_chunks(&items).await;
        assert_eq!(results[0].as_ref().unwrap().chunk_id, "doc_0");
        assert_eq!(results[0].as_ref().unwrap().vector.len(), 16);
        assert!(matches!(results[1], Err(EmbeddingError::EmptyInput)));
    }

    #[tokio::test]
    async fn test_ollama_contract() {
        let base = serve_once("200 OK", r#"{"embedding":[0.1,0.2,0.3]}"#).await;
        let embedder = HttpEmbedder::new(&http_config(EmbeddingProvider::Ollama, base)).unwrap();
        let vector = embedder.embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn test_openai_contract() {
        let base = serve_once("200 OK", r#"{"data":[{"index":0,"embedding":[1.0,0.5]}],"model":"m"}"#).await;
        let embedder = HttpEmbedder::new(&http_config(EmbeddingProvider::OpenAi, base)).unwrap();
        assert_eq!(embedder.embed("hello").await.unwrap(), vec![1.0, 0.5]);
    }

    #[tokio::test]
    async fn test_http_error_and_bad_payload() {
        let base = serve_once("500 Internal Server Error", r#"{"error":"boom"}"#).await;
        let embedder = HttpEmbedder::new(&http_config(EmbeddingProvider::Ollama, base)).unwrap();
        assert!(matches!(embedder.embed("hello").await, Err(EmbeddingError::Model(_))));

        let base = serve_once("200 OK", r#"{"unexpected":true}"#).await;
        let embedder = HttpEmbedder::new(&http_config(EmbeddingProvider::Ollama, base)).unwrap();
        assert!(matches!(embedder.embed("hello").await, Err(EmbeddingError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_unreachable_model_is_unavailable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let embedder =
            HttpEmbedder::new(&http_config(EmbeddingProvider::Ollama, format!("http://{}", addr))).unwrap();
        assert!(matches!(embedder.embed("hello").await, Err(EmbeddingError::Unavailable(_))));
    }
}
