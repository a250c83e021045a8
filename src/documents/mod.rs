//! Reference Document Management Module
//!
//! Handles extraction, table detection, chunking, embedding, indexing and
//! retrieval for uploaded documents.

pub mod chunker;
pub mod document;
pub mod embeddings;
pub mod extractor;
pub mod index;
pub mod retriever;
pub mod tables;

// Re-export key public types
pub use chunker::{Chunk, Chunker, ChunkingError, TableRef};
pub use document::{Document, DocumentFormat, DocumentStatus, DocumentUpload};
pub use embeddings::{
    embedder_from_config, ChunkEmbedding, Embedder, Embedding, EmbeddingError, EmbeddingGenerator,
    HashingEmbedder, HttpEmbedder,
};
pub use extractor::{DocumentExtractor, ExtractedDocument, ExtractionError, Page};
pub use index::{IndexError, IndexRecord, InMemoryIndex, MetadataFilter, SearchResult, VectorIndex};
pub use retriever::{analyze_query, rerank, QueryAnalysis, RetrievalError, RetrievalOutcome, Retriever};
pub use tables::{ExtractedTable, Table, TableExtractor};
