//! Vector Index
//!
//! `VectorIndex` is the seam to the vector store. `InMemoryIndex` keeps one
//! partition per document, each behind its own lock, so writing one
//! document never blocks searches over the others. The Chroma adapter lives
//! in `crate::chroma::index`.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::chunker::Chunk;
use super::embeddings::cosine_similarity;
use crate::error::ErrorKind;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Vector index unavailable: {0}")]
    Unavailable(String),
    #[error("Vector has {actual} dimensions, index holds {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
    #[error("Vector store error: {0}")]
    Store(String),
}

impl Serialize for IndexError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl ErrorKind for IndexError {
    fn kind(&self) -> &'static str {
        "IndexError"
    }
}

/// `{doc_id}_{index}`
pub fn chunk_id(doc_id: &str, index: usize) -> String {
    format!("{}_{}", doc_id, index)
}

/// A stored chunk vector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRecord {
    pub id: String,
    pub doc_id: String,
    pub vector: Vec<f32>,
    pub text: String,
    /// Flat JSON object of scalar values
    pub metadata: Value,
}

impl IndexRecord {
    /// Record for one chunk of a document
    pub fn for_chunk(doc_id: &str, session_id: &str, filename: &str, chunk: &Chunk, vector: Vec<f32>) -> Self {
        let metadata = json!({
            "doc_id": doc_id,
            "session_id": session_id,
            "filename": filename,
            "chunk_index": chunk.index as i64,
            "section_title": chunk.section_title,
            "start_char": chunk.start_char as i64,
            "end_char": chunk.end_char as i64,
            "has_tables": chunk.has_tables,
            "table_numbers": chunk.table_numbers.join(","),
        });
        Self {
            id: chunk_id(doc_id, chunk.index),
            doc_id: doc_id.to_string(),
            vector,
            text: chunk.text.clone(),
            metadata,
        }
    }
}

/// A search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub id: String,
    pub text: String,
    pub metadata: Value,
    pub score: f32,
    #[serde(default)]
    pub contains_table: bool,
    #[serde(default)]
    pub contains_requested_table: bool,
}

/// Metadata equality filter; every field must match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    fields: BTreeMap<String, Value>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(session_id: &str) -> Self {
        Self::new().with("session_id", json!(session_id))
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn matches(&self, metadata: &Value) -> bool {
        self.fields
            .iter()
            .all(|(key, value)| metadata.get(key) == Some(value))
    }

    /// Chroma `where` clause
    pub fn to_where(&self) -> Option<Value> {
        let clauses: Vec<Value> = self
            .fields
            .iter()
            .map(|(k, v)| {
                let mut clause = Map::new();
                clause.insert(k.clone(), json!({ "$eq": v }));
                Value::Object(clause)
            })
            .collect();
        match clauses.len() {
            0 => None,
            1 => clauses.into_iter().next(),
            _ => Some(json!({ "$and": clauses })),
        }
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace one record
    async fn upsert(&self, record: IndexRecord) -> Result<(), IndexError> {
        self.upsert_batch(vec![record]).await
    }

    /// Insert or replace many records; ids already present are overwritten
    async fn upsert_batch(&self, records: Vec<IndexRecord>) -> Result<(), IndexError>;

    /// Nearest neighbours by cosine similarity, best first, at most `limit`
    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>, IndexError>;

    /// Remove every record of a document
    async fn delete_document(&self, doc_id: &str) -> Result<(), IndexError>;

    async fn count(&self) -> Result<usize, IndexError>;

    async fn health(&self) -> Result<(), IndexError>;

    fn name(&self) -> &'static str;
}

type Partition = Arc<RwLock<HashMap<String, IndexRecord>>>;

/// Process-local index
#[derive(Default)]
pub struct InMemoryIndex {
    partitions: RwLock<HashMap<String, Partition>>,
    dimensions: RwLock<Option<usize>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, doc_id: &str) -> Partition {
        if let Some(p) = self.partitions.read().get(doc_id) {
            return p.clone();
        }
        self.partitions
            .write()
            .entry(doc_id.to_string())
            .or_default()
            .clone()
    }

    fn check_dimensions(&self, len: usize) -> Result<(), IndexError> {
        if len == 0 {
            return Err(IndexError::InvalidRecord("empty vector".to_string()));
        }
        if let Some(expected) = *self.dimensions.read() {
            if expected != len {
                return Err(IndexError::DimensionMismatch { expected, actual: len });
            }
            return Ok(());
        }
        let mut dims = self.dimensions.write();
        match *dims {
            Some(expected) if expected != len => Err(IndexError::DimensionMismatch { expected, actual: len }),
            _ => {
                *dims = Some(len);
                Ok(())
            }
        }
    }

    fn snapshot(&self) -> Vec<Partition> {
        self.partitions.read().values().cloned().collect()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert_batch(&self, records: Vec<IndexRecord>) -> Result<(), IndexError> {
        for record in &records {
            self.check_dimensions(record.vector.len())?;
        }

        let mut by_doc: HashMap<String, Vec<IndexRecord>> = HashMap::new();
        for record in records {
            by_doc.entry(record.doc_id.clone()).or_default().push(record);
        }

        for (doc_id, records) in by_doc {
            let partition = self.partition(&doc_id);
            let mut guard = partition.write();
            let count = records.len();
            for record in records {
                guard.insert(record.id.clone(), record);
            }
            debug!(doc_id = %doc_id, count, "Upserted records");
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        if let Some(expected) = *self.dimensions.read() {
            if expected != vector.len() {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }

        let mut results = Vec::new();
        for partition in self.snapshot() {
            let guard = partition.read();
            results.extend(
                guard
                    .values()
                    .filter(|r| filter.map(|f| f.matches(&r.metadata)).unwrap_or(true))
                    .map(|r| SearchResult {
                        id: r.id.clone(),
                        text: r.text.clone(),
                        metadata: r.metadata.clone(),
                        score: cosine_similarity(vector, &r.vector),
                        contains_table: false,
                        contains_requested_table: false,
                    }),
            );
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        results.truncate(limit);
        Ok(results)
    }

    async fn delete_document(&self, doc_id: &str) -> Result<(), IndexError> {
        if let Some(partition) = self.partitions.write().remove(doc_id) {
            debug!(doc_id = %doc_id, count = partition.read().len(), "Deleted document records");
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize, IndexError> {
        Ok(self.snapshot().iter().map(|p| p.read().len()).sum())
    }

    async fn health(&self) -> Result<(), IndexError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
