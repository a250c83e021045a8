//! Document records and their processing lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Source formats the extractor understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    PlainText,
    Markdown,
}

impl DocumentFormat {
    /// Resolve from the declared mime type, falling back to the file extension
    pub fn detect(mime_type: &str, filename: &str) -> Option<Self> {
        Self::from_mime(mime_type).or_else(|| Self::from_filename(filename))
    }

    pub fn from_mime(mime_type: &str) -> Option<Self> {
        let mime = mime_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "application/pdf" => Some(Self::Pdf),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => Some(Self::Docx),
            "text/plain" => Some(Self::PlainText),
            "text/markdown" | "text/x-markdown" => Some(Self::Markdown),
            _ => None,
        }
    }

    pub fn from_filename(filename: &str) -> Option<Self> {
        let ext = Path::new(filename)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "txt" | "text" => Some(Self::PlainText),
            "md" | "markdown" => Some(Self::Markdown),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Docx => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            Self::PlainText => "text/plain",
            Self::Markdown => "text/markdown",
        }
    }
}

/// Pipeline stage of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Extracting,
    Chunking,
    Embedding,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

/// What a caller hands over to ingest a document
#[derive(Debug, Clone)]
pub struct DocumentUpload {
    pub session_id: String,
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// An ingested document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub session_id: String,
    pub filename: String,
    pub mime_type: String,
    pub format: Option<DocumentFormat>,
    #[serde(skip, default = "empty_bytes")]
    pub bytes: Arc<[u8]>,
    pub size_bytes: usize,
    pub status: DocumentStatus,
    /// User-facing explanation when `status` is `failed`
    pub status_reason: Option<String>,
    pub warnings: Vec<String>,
    pub page_count: u32,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn empty_bytes() -> Arc<[u8]> {
    Arc::from(Vec::new())
}

impl Document {
    pub fn from_upload(upload: DocumentUpload) -> Self {
        let now = Utc::now();
        let format = DocumentFormat::detect(&upload.mime_type, &upload.filename);
        let size_bytes = upload.bytes.len();
        Self {
            id: ulid::Ulid::new().to_string(),
            session_id: upload.session_id,
            filename: upload.filename,
            mime_type: upload.mime_type,
            format,
            bytes: Arc::from(upload.bytes),
            size_bytes,
            status: DocumentStatus::Pending,
            status_reason: None,
            warnings: Vec::new(),
            page_count: 0,
            chunk_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: DocumentStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status_reason = Some(reason.into());
        self.set_status(DocumentStatus::Failed);
    }

    /// Clear results of a previous run before re-processing
    pub fn reset(&mut self) {
        self.status_reason = None;
        self.warnings.clear();
        self.page_count = 0;
        self.chunk_count = 0;
        self.set_status(DocumentStatus::Pending);
    }
}
