//! Document Retrieval
//!
//! Embeds a question, searches the vector index and re-ranks hits for
//! table questions: a chunk holding the table the user named is boosted
//! most, any chunk holding a rendered table a little less.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use super::embeddings::{EmbeddingError, EmbeddingGenerator};
use super::index::{IndexError, MetadataFilter, SearchResult, VectorIndex};
use crate::config::RetrievalConfig;
use crate::error::ErrorKind;

static TABLE_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)table\s+(\d+[-.]\d+)").expect("valid regex"));

/// Lower-cased headings the table extractor emits
const TABLE_MARKERS: &[&str] = &["### table", "### extracted table"];

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("Index search failed: {0}")]
    Index(#[from] IndexError),
    #[error("Retrieval timed out after {0:?}")]
    Timeout(Duration),
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl Serialize for RetrievalError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl ErrorKind for RetrievalError {
    fn kind(&self) -> &'static str {
        "RetrievalError"
    }
}

/// What the query asks for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnalysis {
    pub is_table_query: bool,
    /// Table number named in the query, e.g. `2-2`
    pub table_reference: Option<String>,
    pub effective_limit: usize,
}

/// Detect table intent and pick the search limit
pub fn analyze_query(query: &str, config: &RetrievalConfig, top_k: usize) -> QueryAnalysis {
    let is_table_query = query.to_lowercase().contains("table");
    let table_reference = TABLE_REFERENCE
        .captures(query)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());

    QueryAnalysis {
        is_table_query,
        table_reference,
        effective_limit: if is_table_query { config.table_query_limit } else { top_k },
    }
}

/// Boost table chunks for table queries and re-sort, best first
pub fn rerank(results: &mut [SearchResult], analysis: &QueryAnalysis, config: &RetrievalConfig) {
    if !analysis.is_table_query {
        return;
    }
    let reference = analysis.table_reference.as_ref().map(|r| r.to_lowercase());

    for result in results.iter_mut() {
        let text = result.text.to_lowercase();
        result.contains_table = TABLE_MARKERS.iter().any(|m| text.contains(m));

        if reference.as_ref().is_some_and(|r| text.contains(r.as_str())) {
            result.contains_requested_table = true;
            result.score *= config.requested_table_boost;
        } else if result.contains_table {
            result.score *= config.table_boost;
        }
    }

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
}

/// Ranked hits plus how the query was read
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalOutcome {
    pub analysis: QueryAnalysis,
    pub results: Vec<SearchResult>,
}

pub struct Retriever {
    generator: EmbeddingGenerator,
    index: Arc<dyn VectorIndex>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(generator: EmbeddingGenerator, index: Arc<dyn VectorIndex>, config: RetrievalConfig) -> Self {
        Self {
            generator,
            index,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Embed, search and re-rank under the query timeout.
    /// No hits is an empty outcome, not an error.
    pub async fn retrieve(
        &self,
        query: &str,
        session_id: Option<&str>,
        top_k: Option<usize>,
    ) -> Result<RetrievalOutcome, RetrievalError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RetrievalError::InvalidQuery("query is empty".to_string()));
        }

        let analysis = analyze_query(query, &self.config, top_k.unwrap_or(self.config.top_k).max(1));
        let timeout = Duration::from_millis(self.config.query_timeout_ms);
        let filter = session_id.map(MetadataFilter::session);

        let search = async {
            let vector = self.generator.embed(query).await?;
            let hits = self
                .index
                .query(&vector, analysis.effective_limit, filter.as_ref())
                .await?;
            Ok::<_, RetrievalError>(hits)
        };
        let mut results = tokio::time::timeout(timeout, search)
            .await
            .map_err(|_| RetrievalError::Timeout(timeout))??;

        rerank(&mut results, &analysis, &self.config);

        info!(
            results = results.len(),
            table_query = analysis.is_table_query,
            table_reference = ?analysis.table_reference,
            "Retrieved context"
        );
        debug!(limit = analysis.effective_limit, index = self.index.name(), "Retrieval details");
        Ok(RetrievalOutcome { analysis, results })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::embeddings::{Embedder, Embedding, HashingEmbedder};
    use crate::documents::index::{IndexRecord, InMemoryIndex};
    use async_trait::async_trait;
    use serde_json::json;

    fn hit(id: &str, text: &str, score: f32) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            text: text.to_string(),
            metadata: json!({}),
            score,
            contains_table: false,
            contains_requested_table: false,
        }
    }

    #[test]
    fn test_analyze_query() {
        let config = RetrievalConfig::default();
        let a = analyze_query("What is in Table 2-2?", &config, 5);
        assert!(a.is_table_query);
        assert_eq!(a.table_reference.as_deref(), Some("2-2"));
        assert_eq!(a.effective_limit, 10);

        let a = analyze_query("tables of contents", &config, 5);
        assert!(a.is_table_query);
        assert_eq!(a.table_reference, None);

        let a = analyze_query("What is the refresh rate?", &config, 3);
        assert!(!a.is_table_query);
        assert_eq!(a.effective_limit, 3);

        let a = analyze_query("show TABLE 4.1 please", &config, 5);
        assert_eq!(a.table_reference.as_deref(), Some("4.1"));
    }

    #[test]
    fn test_boost_monotonicity() {
        let config = RetrievalConfig::default();
        let analysis = analyze_query("table 2-2", &config, 5);
        let mut results = vec![
            hit("plain", "Plain prose about timing.", 0.5),
            hit("other", "### Table 1-1: Modes\n\n| a | b |", 0.5),
            hit("requested", "### Table 2-2: Pin Map\n\n| a | b |", 0.5),
        ];
        rerank(&mut results, &analysis, &config);

        assert_eq!(results[0].id, "requested");
        assert!(results[0].contains_requested_table);
        assert!(results[0].contains_table);
        assert!((results[0].score - 0.75).abs() < 1e-6);

        assert_eq!(results[1].id, "other");
        assert!(results[1].contains_table);
        assert!(!results[1].contains_requested_table);
        assert!((results[1].score - 0.6).abs() < 1e-6);

        assert_eq!(results[2].id, "plain");
        assert!((results[2].score - 0.5).abs() < 1e-6);
        assert!(results[0].score >= results[1].score && results[1].score >= results[2].score);
    }

    #[test]
    fn test_boost_never_lowers_scores() {
        let config = RetrievalConfig::default();
        let analysis = analyze_query("table 3-1 values", &config, 5);
        let texts = [
            "### Table 3-1: A",
            "### Extracted Table from Page 2",
            "table 3-1 mentioned in prose",
            "nothing",
        ];
        for (i, text) in texts.iter().enumerate() {
            let base = 0.1 + i as f32 * 0.2;
            let mut results = vec![hit("x", text, base)];
            rerank(&mut results, &analysis, &config);
            assert!(results[0].score >= base);
        }
    }

    #[test]
    fn test_non_table_query_untouched() {
        let config = RetrievalConfig::default();
        let analysis = analyze_query("refresh interval", &config, 5);
        let mut results = vec![hit("a", "### Table 1-1: X", 0.2), hit("b", "prose", 0.4)];
        rerank(&mut results, &analysis, &config);
        assert_eq!(results[0].id, "a");
        assert!(!results[0].contains_table);
    }

    async fn seeded_index(embedder: &HashingEmbedder) -> Arc<dyn VectorIndex> {
        let index = InMemoryIndex::new();
        let texts = [
            ("d_0", "s1", "Refresh interval is 3.9 microseconds for LPDDR4."),
            ("d_1", "s1", "### Table 2-2: LPDDR4 Command/Address Pin Map\n\n| Pin | Signal |\n| --- | --- |\n| A0 | CA0 |"),
            ("d_2", "s2", "### Table 2-2: Another session's pin map"),
        ];
        for (id, session, text) in texts {
            index
                .upsert(IndexRecord {
                    id: id.to_string(),
                    doc_id: id.to_string(),
                    vector: embedder.embed_sync(text),
                    text: text.to_string(),
                    metadata: json!({ "session_id": session }),
                })
                .await
                .unwrap();
        }
        Arc::new(index)
    }

    #[tokio::test]
    async fn test_retrieve_boosts_requested_table_within_session() {
        let embedder = HashingEmbedder::new(64);
        let index = seeded_index(&embedder).await;
        let generator = EmbeddingGenerator::new(Arc::new(embedder), Duration::from_secs(1), 2);
        let retriever = Retriever::new(generator, index, RetrievalConfig::default());

        let outcome = retriever
            .retrieve("What does table 2-2 show?", Some("s1"), None)
            .await
            .unwrap();
        assert!(outcome.analysis.is_table_query);
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].id, "d_1");
        assert!(outcome.results[0].contains_requested_table);
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let embedder = HashingEmbedder::new(16);
        let generator = EmbeddingGenerator::new(Arc::new(embedder), Duration::from_secs(1), 1);
        let retriever = Retriever::new(generator, Arc::new(InMemoryIndex::new()), RetrievalConfig::default());
        assert!(matches!(
            retriever.retrieve("  ", None, None).await,
            Err(RetrievalError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_no_results_is_empty_outcome() {
        let embedder = HashingEmbedder::new(16);
        let generator = EmbeddingGenerator::new(Arc::new(embedder), Duration::from_secs(1), 1);
        let retriever = Retriever::new(generator, Arc::new(InMemoryIndex::new()), RetrievalConfig::default());
        let outcome = retriever.retrieve("anything", None, None).await.unwrap();
        assert!(outcome.results.is_empty());
    }

    struct StalledEmbedder;

    #[async_trait]
    impl Embedder for StalledEmbedder {
        async fn embed(&self, _text: &str) -> Result<Embedding, EmbeddingError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(vec![1.0])
        }

        fn dimensions(&self) -> Option<usize> {
            Some(1)
        }

        fn model(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_query_timeout() {
        let generator = EmbeddingGenerator::new(Arc::new(StalledEmbedder), Duration::from_secs(30), 1);
        let config = RetrievalConfig {
            query_timeout_ms: 50,
            ..RetrievalConfig::default()
        };
        let retriever = Retriever::new(generator, Arc::new(InMemoryIndex::new()), config);
        assert!(matches!(
            retriever.retrieve("hello", None, None).await,
            Err(RetrievalError::Timeout(_))
        ));
    }
}
