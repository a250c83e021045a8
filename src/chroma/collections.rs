//! Chroma Collection Schemas
//!
//! Collection naming and lifecycle helpers for document chunks.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::client::{ChromaClient, ChromaError, CollectionInfo};

/// Default collection for document chunks
pub const COLLECTION_DOCUMENT_CHUNKS: &str = "document_chunks";

/// Collection status info
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStatus {
    pub name: String,
    pub id: String,
    pub record_count: u32,
}

/// Collection metadata selecting cosine distance for the HNSW index
pub fn cosine_space_metadata() -> Value {
    json!({ "hnsw:space": "cosine" })
}

/// Ensure the chunk collection exists with cosine distance
pub async fn ensure_chunk_collection(client: &ChromaClient, name: &str) -> Result<CollectionInfo, ChromaError> {
    let collection = client
        .get_or_create_collection(name, Some(cosine_space_metadata()))
        .await?;
    info!(name = %name, id = %collection.id, "Ensured chunk collection");
    Ok(collection)
}

/// Name, id and record count of a collection
pub async fn collection_status(client: &ChromaClient, collection: &CollectionInfo) -> Result<CollectionStatus, ChromaError> {
    let record_count = client.count(&collection.id).await?;
    debug!(name = %collection.name, record_count, "Got collection status");
    Ok(CollectionStatus {
        name: collection.name.clone(),
        id: collection.id.clone(),
        record_count,
    })
}

/// Chroma stores cosine distance; similarity is its complement
pub fn distance_to_score(distance: f32) -> f32 {
    1.0 - distance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_space_metadata() {
        assert_eq!(cosine_space_metadata()["hnsw:space"], "cosine");
    }

    #[test]
    fn test_distance_to_score() {
        assert!((distance_to_score(0.0) - 1.0).abs() < f32::EPSILON);
        assert!((distance_to_score(0.25) - 0.75).abs() < f32::EPSILON);
    }
}
