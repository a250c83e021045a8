//! Session ids.
//!
//! Sessions live outside this crate; documents only carry the owning
//! `session_id`, which scopes ingestion and retrieval.

use serde::Serialize;
use thiserror::Error;

use crate::error::ErrorKind;

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid session ID")]
    InvalidSessionId,
    #[error("Session ID longer than {0} characters")]
    TooLong(usize),
}

impl Serialize for SessionError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl ErrorKind for SessionError {
    fn kind(&self) -> &'static str {
        "InvalidSession"
    }
}

/// Validate session ID contains only safe characters (alphanumeric, hyphens, underscores)
pub fn validate_session_id(session_id: &str) -> Result<(), SessionError> {
    if session_id.is_empty() {
        return Err(SessionError::InvalidSessionId);
    }
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(SessionError::TooLong(MAX_SESSION_ID_LEN));
    }
    if session_id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
        Ok(())
    } else {
        Err(SessionError::InvalidSessionId)
    }
}

/// Accepts ids with or without the `sess_` prefix
pub fn normalize_session_id(session_id: &str) -> Result<String, SessionError> {
    let normalized = session_id.trim().trim_start_matches("sess_");
    validate_session_id(normalized)?;
    Ok(normalized.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("abc-123_X").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("../etc").is_err());
        assert!(validate_session_id("a b").is_err());
        assert!(matches!(
            validate_session_id(&"a".repeat(200)),
            Err(SessionError::TooLong(_))
        ));
    }

    #[test]
    fn test_normalize_strips_prefix() {
        assert_eq!(normalize_session_id("sess_01HX").unwrap(), "01HX");
        assert_eq!(normalize_session_id("01HX").unwrap(), "01HX");
        assert!(normalize_session_id("sess_").is_err());
    }
}
