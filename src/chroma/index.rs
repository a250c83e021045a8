//! `VectorIndex` backed by a Chroma collection.

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::debug;

use super::client::{ChromaClient, ChromaError, ChromaQueryResult, CollectionInfo, UpsertBatch};
use super::collections::{collection_status, distance_to_score, ensure_chunk_collection};
use crate::config::IndexConfig;
use crate::documents::index::{IndexError, IndexRecord, MetadataFilter, SearchResult, VectorIndex};

impl From<ChromaError> for IndexError {
    fn from(e: ChromaError) -> Self {
        match e {
            ChromaError::ServerUnavailable => IndexError::Unavailable("Chroma server not available".to_string()),
            ChromaError::InvalidInput(msg) => IndexError::InvalidRecord(msg),
            other => IndexError::Store(other.to_string()),
        }
    }
}

pub struct ChromaIndex {
    client: ChromaClient,
    collection_name: String,
    collection: OnceCell<CollectionInfo>,
}

impl ChromaIndex {
    pub fn new(client: ChromaClient, collection_name: &str) -> Self {
        Self {
            client,
            collection_name: collection_name.to_string(),
            collection: OnceCell::new(),
        }
    }

    pub fn from_config(config: &IndexConfig) -> Self {
        Self::new(ChromaClient::new(&config.chroma_url), &config.collection)
    }

    /// Collection info, created on first use
    async fn collection(&self) -> Result<&CollectionInfo, IndexError> {
        self.collection
            .get_or_try_init(|| ensure_chunk_collection(&self.client, &self.collection_name))
            .await
            .map_err(IndexError::from)
    }
}

/// Flatten the first query's columns into scored hits, best first
fn search_results(result: ChromaQueryResult) -> Vec<SearchResult> {
    let ids = result.ids.into_iter().next().unwrap_or_default();
    let mut documents = result.documents.and_then(|d| d.into_iter().next()).unwrap_or_default().into_iter();
    let mut metadatas = result.metadatas.and_then(|m| m.into_iter().next()).unwrap_or_default().into_iter();
    let mut distances = result.distances.and_then(|d| d.into_iter().next()).unwrap_or_default().into_iter();

    let mut hits: Vec<SearchResult> = ids
        .into_iter()
        .map(|id| SearchResult {
            id,
            text: documents.next().flatten().unwrap_or_default(),
            metadata: metadatas.next().flatten().unwrap_or_else(|| json!({})),
            score: distance_to_score(distances.next().unwrap_or(1.0)),
            contains_table: false,
            contains_requested_table: false,
        })
        .collect();
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits
}

#[async_trait]
impl VectorIndex for ChromaIndex {
    async fn upsert_batch(&self, records: Vec<IndexRecord>) -> Result<(), IndexError> {
        if records.is_empty() {
            return Ok(());
        }
        let collection = self.collection().await?;

        let mut batch = UpsertBatch::default();
        for record in records {
            batch.ids.push(record.id);
            batch.documents.push(record.text);
            batch.embeddings.push(record.vector);
            batch.metadatas.push(record.metadata);
        }
        self.client.upsert(&collection.id, batch).await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        let collection = self.collection().await?;
        let where_filter = filter.and_then(|f| f.to_where());
        let result = self
            .client
            .query(&collection.id, vector, limit as u32, where_filter)
            .await?;
        let mut hits = search_results(result);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_document(&self, doc_id: &str) -> Result<(), IndexError> {
        let collection = self.collection().await?;
        self.client
            .delete_where(&collection.id, json!({ "doc_id": { "$eq": doc_id } }))
            .await?;
        Ok(())
    }

    async fn count(&self) -> Result<usize, IndexError> {
        let collection = self.collection().await?;
        Ok(self.client.count(&collection.id).await? as usize)
    }

    async fn health(&self) -> Result<(), IndexError> {
        self.client.heartbeat().await?;
        let collection = self.collection().await?;
        let status = collection_status(&self.client, collection).await?;
        debug!(collection = %status.name, records = status.record_count, "Chroma index healthy");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "chroma"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_results_from_columns() {
        let result = ChromaQueryResult {
            ids: vec![vec!["d_1".to_string(), "d_0".to_string()]],
            documents: Some(vec![vec![Some("second".to_string()), None]]),
            metadatas: Some(vec![vec![Some(json!({"doc_id": "d"})), None]]),
            distances: Some(vec![vec![0.5, 0.1]]),
        };
        let hits = search_results(result);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "d_0");
        assert!((hits[0].score - 0.9).abs() < 1e-6);
        assert_eq!(hits[0].text, "");
        assert_eq!(hits[1].metadata["doc_id"], "d");
    }

    #[test]
    fn test_unavailable_maps_to_index_error() {
        let err: IndexError = ChromaError::ServerUnavailable.into();
        assert!(matches!(err, IndexError::Unavailable(_)));
        let err: IndexError = ChromaError::Http("500".to_string()).into();
        assert!(matches!(err, IndexError::Store(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_health() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let index = ChromaIndex::new(ChromaClient::new(&format!("http://{}", addr)), "chunks");
        assert!(matches!(index.health().await, Err(IndexError::Unavailable(_))));
    }
}
