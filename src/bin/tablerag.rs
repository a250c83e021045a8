//! Tablerag CLI
//!
//! Command-line interface for extracting, chunking, ingesting and querying
//! documents. Prints JSON on stdout; logs go to stderr (`RUST_LOG`).

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use tablerag::config::{ConfigError, IndexBackend};
use tablerag::documents::{ChunkingError, DocumentFormat, ExtractedDocument, ExtractedTable, ExtractionError};
use tablerag::{
    ChatClient, ChatError, ChatMessage, Chunker, DocumentExtractor, DocumentUpload, ErrorInfo, ErrorKind,
    QueryOptions, RagConfig, RagService, ServiceError,
};

/// Session used when none is given
const DEFAULT_SESSION: &str = "cli";

#[derive(Parser)]
#[command(name = "tablerag")]
#[command(about = "Tablerag CLI - Table-aware document retrieval", long_about = None)]
struct Cli {
    /// Config file (default: <data dir>/tablerag/config/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override chunk size in characters
    #[arg(long, global = true)]
    chunk_size: Option<usize>,
    /// Override chunk overlap in characters
    #[arg(long, global = true)]
    overlap: Option<usize>,
    /// Use a Chroma server at this URL instead of the in-process index
    #[arg(long, global = true)]
    chroma_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract pages, tables and annotated text from a file
    Extract {
        file: PathBuf,
    },
    /// Extract and chunk a file
    Chunk {
        file: PathBuf,
    },
    /// Extract, chunk, embed and index files
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(short, long, default_value = DEFAULT_SESSION)]
        session: String,
    },
    /// Retrieve context for a question
    Query {
        question: String,
        /// Files to ingest before querying
        #[arg(short, long)]
        file: Vec<PathBuf>,
        #[arg(short, long, default_value = DEFAULT_SESSION)]
        session: String,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Answer a question from documents
    Ask {
        question: String,
        /// Files to ingest before asking
        #[arg(short, long)]
        file: Vec<PathBuf>,
        #[arg(short, long, default_value = DEFAULT_SESSION)]
        session: String,
        /// Ollama base URL for chat; without it answers fall back to a static reply
        #[arg(long)]
        chat_url: Option<String>,
        #[arg(long, default_value = "llama3.1")]
        chat_model: String,
    },
}

// ============ Output Types ============

#[derive(Serialize)]
struct ErrorOutput {
    error: ErrorInfo,
}

#[derive(Serialize)]
struct ExtractOutput<'a> {
    #[serde(flatten)]
    document: &'a ExtractedDocument,
    tables: Vec<ExtractedTable>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChunkOutput<'a> {
    filename: &'a str,
    chunks: Vec<tablerag::Chunk>,
}

// ============ Chat ============

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaChatMessage,
}

#[derive(Deserialize)]
struct OllamaChatMessage {
    content: String,
}

/// Ollama `/api/chat` client
struct OllamaChat {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaChat {
    fn new(base_url: &str, model: &str) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ChatError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/chat", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl ChatClient for OllamaChat {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ChatError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&OllamaChatRequest {
                model: &self.model,
                messages,
                stream: false,
            })
            .send()
            .await
            .map_err(|e| ChatError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Failed(format!("HTTP {}: {}", status, body)));
        }
        let parsed: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Failed(e.to_string()))?;
        Ok(parsed.message.content)
    }
}

/// Stands in when no chat model is configured
struct NoChat;

#[async_trait]
impl ChatClient for NoChat {
    async fn chat(&self, _messages: &[ChatMessage]) -> Result<String, ChatError> {
        Err(ChatError::Unavailable("no chat model configured (use --chat-url)".to_string()))
    }
}

// ============ Main ============

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result = match load_config(&cli) {
        Ok(config) => run(cli.command, config).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(json) => println!("{}", json),
        Err(e) => {
            let output = ErrorOutput { error: error_info(e.as_ref()) };
            println!("{}", serde_json::json!(output));
            std::process::exit(1);
        }
    }
}

async fn run(command: Commands, config: RagConfig) -> Result<String, Box<dyn std::error::Error>> {
    match command {
        Commands::Extract { file } => handle_extract(&file, &config),
        Commands::Chunk { file } => handle_chunk(&file, &config),
        Commands::Ingest { files, session } => handle_ingest(&files, &session, config).await,
        Commands::Query {
            question,
            file,
            session,
            top_k,
        } => handle_query(&question, &file, &session, top_k, config).await,
        Commands::Ask {
            question,
            file,
            session,
            chat_url,
            chat_model,
        } => {
            let chat: Box<dyn ChatClient> = match chat_url {
                Some(url) => Box::new(OllamaChat::new(&url, &chat_model)?),
                None => Box::new(NoChat),
            };
            handle_ask(&question, &file, &session, chat.as_ref(), config).await
        }
    }
}

fn load_config(cli: &Cli) -> Result<RagConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => RagConfig::load_from(path)?,
        None => RagConfig::load()?,
    };
    if let Some(size) = cli.chunk_size {
        config.chunking.chunk_size = size;
    }
    if let Some(overlap) = cli.overlap {
        config.chunking.overlap = overlap;
    }
    if let Some(url) = &cli.chroma_url {
        config.index.backend = IndexBackend::Chroma;
        config.index.chroma_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

/// `{kind, message}` for any error a handler can return
fn error_info(e: &(dyn std::error::Error + 'static)) -> ErrorInfo {
    if let Some(e) = e.downcast_ref::<ServiceError>() {
        return e.to_info();
    }
    if let Some(e) = e.downcast_ref::<ExtractionError>() {
        return e.to_info();
    }
    if let Some(e) = e.downcast_ref::<ChunkingError>() {
        return e.to_info();
    }
    if let Some(e) = e.downcast_ref::<ConfigError>() {
        return e.to_info();
    }
    if let Some(e) = e.downcast_ref::<ChatError>() {
        return e.to_info();
    }
    if e.downcast_ref::<std::io::Error>().is_some() {
        return ErrorInfo::new("IoError", e.to_string());
    }
    ErrorInfo::new("Error", e.to_string())
}

fn read_upload(path: &Path, session: &str) -> Result<DocumentUpload, std::io::Error> {
    let bytes = std::fs::read(path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let mime_type = DocumentFormat::from_filename(&filename)
        .map(|f| f.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok(DocumentUpload {
        session_id: session.to_string(),
        filename,
        mime_type,
        bytes,
    })
}

async fn ready_service(config: RagConfig) -> Result<RagService, ServiceError> {
    let service = RagService::from_config(config)?;
    service.initialize().await?;
    Ok(service)
}

async fn ingest_all(
    service: &RagService,
    files: &[PathBuf],
    session: &str,
) -> Result<Vec<tablerag::IngestReport>, Box<dyn std::error::Error>> {
    let mut reports = Vec::with_capacity(files.len());
    for path in files {
        let doc_id = service.register_document(read_upload(path, session)?)?;
        reports.push(service.process_document(&doc_id).await?);
    }
    Ok(reports)
}

// ============ Handlers ============

fn handle_extract(file: &Path, config: &RagConfig) -> Result<String, Box<dyn std::error::Error>> {
    let upload = read_upload(file, DEFAULT_SESSION)?;
    let extractor = DocumentExtractor::new(config.tables.clone());
    let extracted = extractor.extract(&upload.bytes, &upload.mime_type, &upload.filename)?;
    let output = ExtractOutput {
        document: &extracted,
        tables: extracted.tables(),
    };
    Ok(serde_json::to_string(&output)?)
}

fn handle_chunk(file: &Path, config: &RagConfig) -> Result<String, Box<dyn std::error::Error>> {
    let upload = read_upload(file, DEFAULT_SESSION)?;
    let extractor = DocumentExtractor::new(config.tables.clone());
    let extracted = extractor.extract(&upload.bytes, &upload.mime_type, &upload.filename)?;
    let chunker = Chunker::with_detectors(
        config.chunking.clone(),
        config.tables.clone(),
        Box::new(tablerag::documents::chunker::NumberedSectionDetector),
        Box::new(tablerag::documents::tables::RegexCaptionDetector),
    )?;
    let output = ChunkOutput {
        filename: &upload.filename,
        chunks: chunker.chunk(&extracted.text)?,
    };
    Ok(serde_json::to_string(&output)?)
}

async fn handle_ingest(files: &[PathBuf], session: &str, config: RagConfig) -> Result<String, Box<dyn std::error::Error>> {
    let service = ready_service(config).await?;
    let reports = ingest_all(&service, files, session).await?;
    Ok(serde_json::to_string(&reports)?)
}

async fn handle_query(
    question: &str,
    files: &[PathBuf],
    session: &str,
    top_k: Option<usize>,
    config: RagConfig,
) -> Result<String, Box<dyn std::error::Error>> {
    let service = ready_service(config).await?;
    ingest_all(&service, files, session).await?;
    let options = QueryOptions {
        session_id: Some(session.to_string()),
        top_k,
    };
    let response = service.retrieve_context(question, &options).await;
    Ok(serde_json::to_string(&response)?)
}

async fn handle_ask(
    question: &str,
    files: &[PathBuf],
    session: &str,
    chat: &dyn ChatClient,
    config: RagConfig,
) -> Result<String, Box<dyn std::error::Error>> {
    let service = ready_service(config).await?;
    ingest_all(&service, files, session).await?;
    let options = QueryOptions {
        session_id: Some(session.to_string()),
        top_k: None,
    };
    let answer = service.answer(question, &options, chat).await;
    Ok(serde_json::to_string(&answer)?)
}
