// Tablerag Library
// Exports core modules for use by both embedding services and the CLI binary

pub mod chroma;
pub mod config;
pub mod context;
pub mod documents;
pub mod error;
pub mod service;
pub mod session;

// Re-export commonly used types for CLI
pub use config::{ConfigError, IndexBackend, RagConfig};
pub use context::{build_prompt, count_tokens, AssembledContext, ChatMessage, ChatRole, PromptPlan, Source, NO_CONTEXT_MESSAGE};
pub use documents::{
    Chunk, Chunker, Document, DocumentExtractor, DocumentStatus, DocumentUpload, ExtractedDocument, SearchResult,
    Table, VectorIndex,
};
pub use error::{ErrorInfo, ErrorKind};
pub use service::{
    AnswerStrategy, ChatAnswer, ChatClient, ChatError, ContextResponse, IngestReport, QueryOptions, RagService,
    ServiceError, ServiceState, STATIC_FALLBACK_MESSAGE,
};
pub use session::{normalize_session_id, validate_session_id, SessionError};
