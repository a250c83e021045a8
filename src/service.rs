//! RAG Service
//!
//! One object owns the pipeline: documents are registered, processed in the
//! background (extract, chunk, embed, index) and later searched to ground
//! chat answers. Built once at start-up and shared as `Arc<RagService>`.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::chroma::ChromaIndex;
use crate::config::{ConfigError, IndexBackend, RagConfig};
use crate::context::{build_prompt, AssembledContext, ChatMessage, ContextAssembler, PromptPlan, Source};
use crate::documents::chunker::{Chunker, ChunkingError, NumberedSectionDetector};
use crate::documents::document::{Document, DocumentStatus, DocumentUpload};
use crate::documents::embeddings::{embedder_from_config, Embedder, EmbeddingError, EmbeddingGenerator};
use crate::documents::extractor::{DocumentExtractor, ExtractionError};
use crate::documents::index::{chunk_id, InMemoryIndex, IndexError, IndexRecord, VectorIndex};
use crate::documents::retriever::{QueryAnalysis, RetrievalError, Retriever};
use crate::documents::tables::RegexCaptionDetector;
use crate::error::{ErrorInfo, ErrorKind};
use crate::session::{normalize_session_id, SessionError};

/// Reply when neither the augmented nor the plain chat path worked
pub const STATIC_FALLBACK_MESSAGE: &str =
    "I'm unable to reach the assistant right now. Please try again in a moment.";

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Chat model unavailable: {0}")]
    Unavailable(String),
    #[error("Chat request failed: {0}")]
    Failed(String),
    #[error("Chat model returned an empty reply")]
    EmptyResponse,
}

impl Serialize for ChatError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl ErrorKind for ChatError {
    fn kind(&self) -> &'static str {
        "ChatError"
    }
}

/// External chat completion client
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ChatError>;
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Service not ready (state: {0})")]
    NotReady(String),
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Document is already being processed: {0}")]
    AlreadyProcessing(String),
    #[error(transparent)]
    InvalidSession(#[from] SessionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Chunking(#[from] ChunkingError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Chat(#[from] ChatError),
}

impl Serialize for ServiceError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl ErrorKind for ServiceError {
    fn kind(&self) -> &'static str {
        match self {
            ServiceError::NotReady(_) => "NotReady",
            ServiceError::NotFound(_) => "NotFound",
            ServiceError::AlreadyProcessing(_) => "AlreadyProcessing",
            ServiceError::InvalidSession(e) => e.kind(),
            ServiceError::Config(e) => e.kind(),
            ServiceError::Extraction(e) => e.kind(),
            ServiceError::Chunking(e) => e.kind(),
            ServiceError::Embedding(e) => e.kind(),
            ServiceError::Index(e) => e.kind(),
            ServiceError::Retrieval(e) => e.kind(),
            ServiceError::Chat(e) => e.kind(),
        }
    }
}

/// Service lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ServiceState {
    Uninitialized,
    Initializing,
    Ready,
    Failed(String),
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Uninitialized => write!(f, "uninitialized"),
            ServiceState::Initializing => write!(f, "initializing"),
            ServiceState::Ready => write!(f, "ready"),
            ServiceState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Outcome of one processing run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub doc_id: String,
    pub status: DocumentStatus,
    pub page_count: u32,
    pub table_count: usize,
    pub chunk_count: usize,
    pub embedded_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryOptions {
    pub session_id: Option<String>,
    pub top_k: Option<usize>,
}

/// Query API response; failures are reported in-band
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextResponse {
    pub success: bool,
    pub context: String,
    pub sources: Vec<Source>,
    pub is_table_query: bool,
    pub table_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ContextResponse {
    fn found(analysis: QueryAnalysis, assembled: AssembledContext) -> Self {
        Self {
            success: true,
            context: assembled.context,
            sources: assembled.sources,
            is_table_query: analysis.is_table_query,
            table_reference: analysis.table_reference,
            error: None,
        }
    }

    fn failed(error: ErrorInfo) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::default()
        }
    }
}

/// How an answer was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStrategy {
    AugmentedChat,
    PlainChat,
    StaticFallback,
    NoContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatAnswer {
    pub answer: String,
    pub strategy: AnswerStrategy,
    pub sources: Vec<Source>,
    pub is_table_query: bool,
}

/// Releases a document's in-flight slot on drop
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    doc_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.doc_id);
    }
}

/// What the pipeline needs from a document, taken once up front
struct PipelineInput {
    doc_id: String,
    session_id: String,
    filename: String,
    mime_type: String,
    bytes: Arc<[u8]>,
}

pub struct RagService {
    config: RagConfig,
    state: RwLock<ServiceState>,
    documents: RwLock<HashMap<String, Document>>,
    in_flight: Mutex<HashSet<String>>,
    extractor: DocumentExtractor,
    chunker: Chunker,
    generator: EmbeddingGenerator,
    index: Arc<dyn VectorIndex>,
    retriever: Retriever,
    assembler: ContextAssembler,
}

impl RagService {
    pub fn new(config: RagConfig, embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> Result<Self, ServiceError> {
        config.validate()?;
        let chunker = Chunker::with_detectors(
            config.chunking.clone(),
            config.tables.clone(),
            Box::new(NumberedSectionDetector),
            Box::new(RegexCaptionDetector),
        )?;
        let generator = EmbeddingGenerator::from_config(embedder, &config.embedding);
        let retriever = Retriever::new(generator.clone(), index.clone(), config.retrieval.clone());

        Ok(Self {
            extractor: DocumentExtractor::new(config.tables.clone()),
            assembler: ContextAssembler::from_config(&config.retrieval),
            chunker,
            generator,
            index,
            retriever,
            state: RwLock::new(ServiceState::Uninitialized),
            documents: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            config,
        })
    }

    /// Build the embedder and index named in configuration
    pub fn from_config(config: RagConfig) -> Result<Self, ServiceError> {
        let embedder = embedder_from_config(&config.embedding)?;
        let index: Arc<dyn VectorIndex> = match config.index.backend {
            IndexBackend::Memory => Arc::new(InMemoryIndex::new()),
            IndexBackend::Chroma => Arc::new(ChromaIndex::from_config(&config.index)),
        };
        Self::new(config, embedder, index)
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn state(&self) -> ServiceState {
        self.state.read().clone()
    }

    /// Health-check the embedding model and the index
    pub async fn initialize(&self) -> Result<(), ServiceError> {
        *self.state.write() = ServiceState::Initializing;

        let checked = async {
            self.generator.health().await?;
            self.index.health().await?;
            Ok::<_, ServiceError>(())
        }
        .await;

        match checked {
            Ok(()) => {
                info!(
                    index = self.index.name(),
                    model = self.generator.embedder().model(),
                    "RAG service ready"
                );
                *self.state.write() = ServiceState::Ready;
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "RAG service failed to initialize");
                *self.state.write() = ServiceState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn ensure_ready(&self) -> Result<(), ServiceError> {
        match &*self.state.read() {
            ServiceState::Ready => Ok(()),
            other => Err(ServiceError::NotReady(other.to_string())),
        }
    }

    fn begin(&self, doc_id: &str) -> Result<InFlightGuard<'_>, ServiceError> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(doc_id.to_string()) {
            return Err(ServiceError::AlreadyProcessing(doc_id.to_string()));
        }
        Ok(InFlightGuard {
            in_flight: &self.in_flight,
            doc_id: doc_id.to_string(),
        })
    }

    fn update<F>(&self, doc_id: &str, f: F) -> Result<(), ServiceError>
    where
        F: FnOnce(&mut Document),
    {
        let mut documents = self.documents.write();
        let doc = documents
            .get_mut(doc_id)
            .ok_or_else(|| ServiceError::NotFound(doc_id.to_string()))?;
        f(doc);
        Ok(())
    }

    fn set_status(&self, doc_id: &str, status: DocumentStatus) -> Result<(), ServiceError> {
        info!(doc_id = %doc_id, status = ?status, "Document status");
        self.update(doc_id, |doc| doc.set_status(status))
    }

    // ============ INGESTION ============

    /// Record a `pending` document without processing it
    pub fn register_document(&self, upload: DocumentUpload) -> Result<String, ServiceError> {
        self.ensure_ready()?;
        let session_id = normalize_session_id(&upload.session_id)?;
        let doc = Document::from_upload(DocumentUpload { session_id, ..upload });
        let doc_id = doc.id.clone();
        info!(doc_id = %doc_id, filename = %doc.filename, size = doc.size_bytes, "Document registered");
        self.documents.write().insert(doc_id.clone(), doc);
        Ok(doc_id)
    }

    /// Register a document and process it in the background.
    /// Returns the document id at once.
    pub fn submit_document(self: &Arc<Self>, upload: DocumentUpload) -> Result<String, ServiceError> {
        let doc_id = self.register_document(upload)?;

        let service = Arc::clone(self);
        let id = doc_id.clone();
        tokio::spawn(async move {
            if let Err(e) = service.process_document(&id).await {
                warn!(doc_id = %id, error = %e, "Background processing failed");
            }
        });
        Ok(doc_id)
    }

    /// Extract, chunk, embed and index one document.
    /// Rejected while another run for the same document is in flight.
    pub async fn process_document(&self, doc_id: &str) -> Result<IngestReport, ServiceError> {
        self.ensure_ready()?;
        let input = {
            let documents = self.documents.read();
            let doc = documents
                .get(doc_id)
                .ok_or_else(|| ServiceError::NotFound(doc_id.to_string()))?;
            PipelineInput {
                doc_id: doc.id.clone(),
                session_id: doc.session_id.clone(),
                filename: doc.filename.clone(),
                mime_type: doc.mime_type.clone(),
                bytes: doc.bytes.clone(),
            }
        };
        let _guard = self.begin(doc_id)?;
        self.update(doc_id, |doc| doc.reset())?;

        match self.run_pipeline(&input).await {
            Ok(report) => Ok(report),
            Err(e) => {
                error!(doc_id = %doc_id, error = %e, "Document processing failed");
                let reason = failure_reason(&e);
                self.update(doc_id, |doc| doc.fail(reason))?;
                Err(e)
            }
        }
    }

    async fn run_pipeline(&self, input: &PipelineInput) -> Result<IngestReport, ServiceError> {
        let doc_id = input.doc_id.as_str();

        // Old chunks go first so a failed run leaves nothing stale behind
        self.index.delete_document(doc_id).await?;

        self.set_status(doc_id, DocumentStatus::Extracting)?;
        let extracted = self.extractor.extract(&input.bytes, &input.mime_type, &input.filename)?;
        let mut warnings = extracted.warnings.clone();
        let page_count = extracted.page_count;
        self.update(doc_id, |doc| {
            doc.page_count = page_count;
            doc.warnings = warnings.clone();
        })?;

        self.set_status(doc_id, DocumentStatus::Chunking)?;
        let chunks = self.chunker.chunk(&extracted.text)?;
        if chunks.is_empty() {
            return Err(ExtractionError::NoContent.into());
        }

        self.set_status(doc_id, DocumentStatus::Embedding)?;
        let items: Vec<(String, String)> = chunks
            .iter()
            .map(|c| (chunk_id(doc_id, c.index), c.text.clone()))
            .collect();
        let embeddings = self.generator.embed_chunks(&items).await;

        let mut records = Vec::with_capacity(chunks.len());
        let mut first_failure = None;
        for (chunk, embedded) in chunks.iter().zip(embeddings) {
            match embedded {
                Ok(embedding) => records.push(IndexRecord::for_chunk(
                    doc_id,
                    &input.session_id,
                    &input.filename,
                    chunk,
                    embedding.vector,
                )),
                Err(e) => {
                    warnings.push(format!("Chunk {} ({}) was not embedded: {}", chunk.index, chunk.section_title, e));
                    first_failure.get_or_insert(e);
                }
            }
        }
        if records.is_empty() {
            return Err(first_failure.unwrap_or(EmbeddingError::EmptyInput).into());
        }

        let embedded_count = records.len();
        self.index.upsert_batch(records).await?;

        self.update(doc_id, |doc| {
            doc.chunk_count = embedded_count;
            doc.warnings = warnings.clone();
            doc.set_status(DocumentStatus::Ready);
        })?;

        let report = IngestReport {
            doc_id: doc_id.to_string(),
            status: DocumentStatus::Ready,
            page_count,
            table_count: extracted.table_count(),
            chunk_count: chunks.len(),
            embedded_count,
            warnings,
        };
        info!(
            doc_id = %doc_id,
            pages = report.page_count,
            tables = report.table_count,
            chunks = report.chunk_count,
            embedded = report.embedded_count,
            warnings = report.warnings.len(),
            "Document ready"
        );
        Ok(report)
    }

    /// Run the pipeline again from the stored bytes
    pub async fn reprocess_document(&self, doc_id: &str) -> Result<IngestReport, ServiceError> {
        info!(doc_id = %doc_id, "Reprocessing document");
        self.process_document(doc_id).await
    }

    pub fn document(&self, doc_id: &str) -> Result<Document, ServiceError> {
        self.documents
            .read()
            .get(doc_id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(doc_id.to_string()))
    }

    /// Documents of a session, oldest first
    pub fn documents_for_session(&self, session_id: &str) -> Result<Vec<Document>, ServiceError> {
        let session_id = normalize_session_id(session_id)?;
        let mut docs: Vec<Document> = self
            .documents
            .read()
            .values()
            .filter(|d| d.session_id == session_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(docs)
    }

    /// Drop a document and its chunks
    pub async fn remove_document(&self, doc_id: &str) -> Result<(), ServiceError> {
        self.ensure_ready()?;
        if !self.documents.read().contains_key(doc_id) {
            return Err(ServiceError::NotFound(doc_id.to_string()));
        }
        let _guard = self.begin(doc_id)?;
        self.index.delete_document(doc_id).await?;
        self.documents.write().remove(doc_id);
        info!(doc_id = %doc_id, "Removed document");
        Ok(())
    }

    // ============ QUERY ============

    async fn assemble_context(
        &self,
        query: &str,
        options: &QueryOptions,
    ) -> Result<(QueryAnalysis, AssembledContext), ServiceError> {
        self.ensure_ready()?;
        let session_id = options.session_id.as_deref().map(normalize_session_id).transpose()?;
        let outcome = self
            .retriever
            .retrieve(query, session_id.as_deref(), options.top_k)
            .await?;
        let assembled = self.assembler.assemble(&outcome.results, outcome.analysis.is_table_query);
        Ok((outcome.analysis, assembled))
    }

    /// Retrieve and assemble context for a question
    pub async fn retrieve_context(&self, query: &str, options: &QueryOptions) -> ContextResponse {
        match self.assemble_context(query, options).await {
            Ok((analysis, assembled)) => ContextResponse::found(analysis, assembled),
            Err(e) => {
                warn!(error = %e, "Context retrieval failed");
                ContextResponse::failed(e.to_info())
            }
        }
    }

    /// Answer a question, degrading from augmented chat to plain chat to a
    /// static reply
    pub async fn answer(&self, query: &str, options: &QueryOptions, chat: &dyn ChatClient) -> ChatAnswer {
        let (strategies, analysis, assembled) = match self.assemble_context(query, options).await {
            Ok((analysis, assembled)) if assembled.is_empty() => {
                info!(strategy = ?AnswerStrategy::NoContext, "Answered");
                return ChatAnswer {
                    answer: crate::context::NO_CONTEXT_MESSAGE.to_string(),
                    strategy: AnswerStrategy::NoContext,
                    sources: Vec::new(),
                    is_table_query: analysis.is_table_query,
                };
            }
            Ok((analysis, assembled)) => (
                vec![AnswerStrategy::AugmentedChat, AnswerStrategy::PlainChat, AnswerStrategy::StaticFallback],
                Some(analysis),
                assembled,
            ),
            Err(e) => {
                warn!(error = %e, "Retrieval failed, answering without documents");
                (
                    vec![AnswerStrategy::PlainChat, AnswerStrategy::StaticFallback],
                    None,
                    AssembledContext::default(),
                )
            }
        };

        for strategy in strategies {
            match run_strategy(strategy, query, &assembled, chat).await {
                Ok(answer) => {
                    info!(strategy = ?strategy, "Answered");
                    let sources = if strategy == AnswerStrategy::AugmentedChat {
                        assembled.sources
                    } else {
                        Vec::new()
                    };
                    return ChatAnswer {
                        answer,
                        strategy,
                        sources,
                        is_table_query: analysis.map(|a| a.is_table_query).unwrap_or(false),
                    };
                }
                Err(e) => warn!(strategy = ?strategy, error = %e, "Answer strategy failed"),
            }
        }

        ChatAnswer {
            answer: STATIC_FALLBACK_MESSAGE.to_string(),
            strategy: AnswerStrategy::StaticFallback,
            sources: Vec::new(),
            is_table_query: false,
        }
    }
}

async fn run_strategy(
    strategy: AnswerStrategy,
    query: &str,
    assembled: &AssembledContext,
    chat: &dyn ChatClient,
) -> Result<String, ChatError> {
    let reply = match strategy {
        AnswerStrategy::AugmentedChat => match build_prompt(query, assembled) {
            PromptPlan::Augmented(messages) => chat.chat(&messages).await?,
            PromptPlan::NoContext(message) => message.to_string(),
        },
        AnswerStrategy::PlainChat => chat.chat(&[ChatMessage::user(query)]).await?,
        AnswerStrategy::StaticFallback => STATIC_FALLBACK_MESSAGE.to_string(),
        AnswerStrategy::NoContext => crate::context::NO_CONTEXT_MESSAGE.to_string(),
    };
    if reply.trim().is_empty() {
        return Err(ChatError::EmptyResponse);
    }
    Ok(reply)
}

/// Status reason shown to the user for a failed run
fn failure_reason(e: &ServiceError) -> String {
    match e {
        ServiceError::Extraction(ExtractionError::UnsupportedFormat(format)) => {
            format!("This file type is not supported ({}). Upload a PDF, DOCX, text or Markdown file.", format)
        }
        ServiceError::Extraction(ExtractionError::NoContent) => {
            "No text could be extracted from this document. Scanned pages are not supported.".to_string()
        }
        ServiceError::Extraction(ExtractionError::Corrupt(_)) => {
            "The file appears to be damaged and could not be read.".to_string()
        }
        ServiceError::Embedding(_) => "The embedding model could not process this document.".to_string(),
        ServiceError::Index(_) => "The document could not be stored for search.".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::embeddings::{Embedding, HashingEmbedder};
    use crate::documents::index::MetadataFilter;
    use std::time::Duration;

    const DATASHEET: &str = "1 Introduction\n\
This controller drives LPDDR4 memory devices at up to 4266 MT/s.\n\
\n\
2 Pin Data\n\
The command/address pins are listed below.\n\
\n\
Table 2-2: LPDDR4 Command/Address Pin Map\n\
| Pin | Signal |\n\
| --- | --- |\n\
| A0 | CA0 |\n\
| A1 | CA1 |\n\
\n\
Refresh is issued every 3.9 microseconds.\n";

    struct EchoChat;

    #[async_trait]
    impl ChatClient for EchoChat {
        async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ChatError> {
            Ok(format!("{} messages", messages.len()))
        }
    }

    /// Fails whenever a system message is present
    struct PlainOnlyChat;

    #[async_trait]
    impl ChatClient for PlainOnlyChat {
        async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ChatError> {
            if messages.len() > 1 {
                return Err(ChatError::Failed("context too long".to_string()));
            }
            Ok("plain answer".to_string())
        }
    }

    struct DownChat;

    #[async_trait]
    impl ChatClient for DownChat {
        async fn chat(&self, _messages: &[ChatMessage]) -> Result<String, ChatError> {
            Err(ChatError::Unavailable("connection refused".to_string()))
        }
    }

    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(HashingEmbedder::new(32).embed_sync(text))
        }

        fn dimensions(&self) -> Option<usize> {
            Some(32)
        }

        fn model(&self) -> &str {
            "slow"
        }

        async fn health(&self) -> Result<(), EmbeddingError> {
            Ok(())
        }
    }

    struct DownIndex;

    #[async_trait]
    impl VectorIndex for DownIndex {
        async fn upsert_batch(&self, _records: Vec<IndexRecord>) -> Result<(), IndexError> {
            Err(IndexError::Unavailable("down".to_string()))
        }

        async fn query(
            &self,
            _vector: &[f32],
            _limit: usize,
            _filter: Option<&MetadataFilter>,
        ) -> Result<Vec<crate::documents::index::SearchResult>, IndexError> {
            Err(IndexError::Unavailable("down".to_string()))
        }

        async fn delete_document(&self, _doc_id: &str) -> Result<(), IndexError> {
            Err(IndexError::Unavailable("down".to_string()))
        }

        async fn count(&self) -> Result<usize, IndexError> {
            Err(IndexError::Unavailable("down".to_string()))
        }

        async fn health(&self) -> Result<(), IndexError> {
            Err(IndexError::Unavailable("down".to_string()))
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    fn small_config() -> RagConfig {
        let mut config = RagConfig::default();
        config.chunking.chunk_size = 200;
        config.chunking.overlap = 40;
        config
    }

    fn upload(session: &str, name: &str, text: &str) -> DocumentUpload {
        DocumentUpload {
            session_id: session.to_string(),
            filename: name.to_string(),
            mime_type: "text/plain".to_string(),
            bytes: text.as_bytes().to_vec(),
        }
    }

    async fn ready_service(embedder: Arc<dyn Embedder>) -> (Arc<RagService>, Arc<InMemoryIndex>) {
        let index = Arc::new(InMemoryIndex::new());
        let service = RagService::new(small_config(), embedder, index.clone()).unwrap();
        service.initialize().await.unwrap();
        (Arc::new(service), index)
    }

    fn register(service: &RagService, upload: DocumentUpload) -> String {
        service.register_document(upload).unwrap()
    }

    #[tokio::test]
    async fn test_state_machine() {
        let service = RagService::new(
            RagConfig::default(),
            Arc::new(HashingEmbedder::default()),
            Arc::new(InMemoryIndex::new()),
        )
        .unwrap();
        assert_eq!(service.state(), ServiceState::Uninitialized);
        assert!(matches!(service.process_document("x").await, Err(ServiceError::NotReady(_))));
        let response = service.retrieve_context("anything", &QueryOptions::default()).await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().kind, "NotReady");

        service.initialize().await.unwrap();
        assert_eq!(service.state(), ServiceState::Ready);
        assert!(matches!(service.process_document("x").await, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_initialization() {
        let service = RagService::new(
            RagConfig::default(),
            Arc::new(HashingEmbedder::default()),
            Arc::new(DownIndex),
        )
        .unwrap();
        assert!(service.initialize().await.is_err());
        assert!(matches!(service.state(), ServiceState::Failed(_)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RagConfig::default();
        config.chunking.overlap = config.chunking.chunk_size;
        let result = RagService::new(config, Arc::new(HashingEmbedder::default()), Arc::new(InMemoryIndex::new()));
        assert!(matches!(result, Err(ServiceError::Config(_))));
    }

    #[tokio::test]
    async fn test_idempotent_reingestion() {
        let (service, index) = ready_service(Arc::new(HashingEmbedder::new(64))).await;
        let id = register(&service, upload("s1", "lpddr4.txt", DATASHEET));

        let first = service.process_document(&id).await.unwrap();
        let count_after_first = index.count().await.unwrap();
        assert!(first.chunk_count > 0);
        assert_eq!(first.table_count, 1);
        assert_eq!(count_after_first, first.embedded_count);

        let second = service.reprocess_document(&id).await.unwrap();
        assert_eq!(second.chunk_count, first.chunk_count);
        assert_eq!(index.count().await.unwrap(), count_after_first);

        let doc = service.document(&id).unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);
        assert_eq!(doc.chunk_count, second.embedded_count);
    }

    #[tokio::test]
    async fn test_in_flight_rejection() {
        let (service, _) = ready_service(Arc::new(SlowEmbedder)).await;
        let id = register(&service, upload("s1", "lpddr4.txt", DATASHEET));

        let background = {
            let service = service.clone();
            let id = id.clone();
            tokio::spawn(async move { service.process_document(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            service.process_document(&id).await,
            Err(ServiceError::AlreadyProcessing(_))
        ));
        assert!(matches!(
            service.remove_document(&id).await,
            Err(ServiceError::AlreadyProcessing(_))
        ));

        background.await.unwrap().unwrap();
        // Slot released after the run
        assert!(service.process_document(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_submit_processes_in_background() {
        let (service, index) = ready_service(Arc::new(HashingEmbedder::new(64))).await;
        let id = service.submit_document(upload("sess_s1", "lpddr4.txt", DATASHEET)).unwrap();

        let mut status = service.document(&id).unwrap().status;
        for _ in 0..100 {
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = service.document(&id).unwrap().status;
        }
        assert_eq!(status, DocumentStatus::Ready);
        let doc = service.document(&id).unwrap();
        assert!(doc.chunk_count > 0);
        assert_eq!(index.count().await.unwrap(), doc.chunk_count);
        assert_eq!(service.documents_for_session("s1").unwrap().len(), 1);
        assert!(service.documents_for_session("s2").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_session_rejected() {
        let (service, _) = ready_service(Arc::new(HashingEmbedder::new(64))).await;
        let err = service.submit_document(upload("../x", "a.txt", "text")).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidSession(_)));
        assert_eq!(err.kind(), "InvalidSession");
    }

    #[tokio::test]
    async fn test_extraction_failure_marks_document_failed() {
        let (service, index) = ready_service(Arc::new(HashingEmbedder::new(64))).await;
        let id = register(
            &service,
            DocumentUpload {
                session_id: "s1".to_string(),
                filename: "scan.png".to_string(),
                mime_type: "image/png".to_string(),
                bytes: vec![0x89, 0x50, 0x4e, 0x47],
            },
        );

        let err = service.process_document(&id).await.unwrap_err();
        assert_eq!(err.kind(), "ExtractionError");
        let doc = service.document(&id).unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert!(doc.status_reason.unwrap().contains("not supported"));
        assert_eq!(index.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_document() {
        let (service, index) = ready_service(Arc::new(HashingEmbedder::new(64))).await;
        let id = register(&service, upload("s1", "lpddr4.txt", DATASHEET));
        service.process_document(&id).await.unwrap();

        service.remove_document(&id).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 0);
        assert!(matches!(service.document(&id), Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_empty_context_fallback() {
        let (service, _) = ready_service(Arc::new(HashingEmbedder::new(64))).await;
        let response = service.retrieve_context("What is the refresh rate?", &QueryOptions::default()).await;
        assert!(response.success);
        assert_eq!(response.context, "");
        assert!(response.sources.is_empty());

        let answer = service
            .answer("What is the refresh rate?", &QueryOptions::default(), &EchoChat)
            .await;
        assert_eq!(answer.strategy, AnswerStrategy::NoContext);
        assert_eq!(answer.answer, crate::context::NO_CONTEXT_MESSAGE);
    }

    #[tokio::test]
    async fn test_table_query_context() {
        let (service, _) = ready_service(Arc::new(HashingEmbedder::new(64))).await;
        let id = register(&service, upload("s1", "lpddr4.txt", DATASHEET));
        service.process_document(&id).await.unwrap();

        let options = QueryOptions {
            session_id: Some("s1".to_string()),
            top_k: None,
        };
        let response = service.retrieve_context("Show me table 2-2", &options).await;
        assert!(response.success);
        assert!(response.is_table_query);
        assert_eq!(response.table_reference.as_deref(), Some("2-2"));
        assert!(response.context.contains("| A0 | CA0 |"));
        assert!(response.sources[0].contains_requested_table);

        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("isTableQuery").is_some());
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_answer_strategy_chain() {
        let (service, _) = ready_service(Arc::new(HashingEmbedder::new(64))).await;
        let id = register(&service, upload("s1", "lpddr4.txt", DATASHEET));
        service.process_document(&id).await.unwrap();
        let options = QueryOptions::default();

        let answer = service.answer("pin map table", &options, &EchoChat).await;
        assert_eq!(answer.strategy, AnswerStrategy::AugmentedChat);
        assert_eq!(answer.answer, "2 messages");
        assert!(!answer.sources.is_empty());

        let answer = service.answer("pin map table", &options, &PlainOnlyChat).await;
        assert_eq!(answer.strategy, AnswerStrategy::PlainChat);
        assert!(answer.sources.is_empty());

        let answer = service.answer("pin map table", &options, &DownChat).await;
        assert_eq!(answer.strategy, AnswerStrategy::StaticFallback);
        assert_eq!(answer.answer, STATIC_FALLBACK_MESSAGE);
    }

    #[tokio::test]
    async fn test_retrieval_failure_answers_plainly() {
        let (service, _) = ready_service(Arc::new(HashingEmbedder::new(64))).await;
        let response = service.retrieve_context("   ", &QueryOptions::default()).await;
        assert!(!response.success);
        assert_eq!(response.error.as_ref().unwrap().kind, "RetrievalError");

        let answer = service.answer("   ", &QueryOptions::default(), &EchoChat).await;
        assert_eq!(answer.strategy, AnswerStrategy::PlainChat);
        assert_eq!(answer.answer, "1 messages");
    }
}
