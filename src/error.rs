//! Structured error form used at component boundaries.

use serde::{Deserialize, Serialize};

/// `{kind, message}` pair handed to callers instead of raw error chains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Errors that can name their category
pub trait ErrorKind: std::error::Error {
    /// Stable category name, e.g. `"ExtractionError"`
    fn kind(&self) -> &'static str;

    fn to_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.kind(), self.to_string())
    }
}
