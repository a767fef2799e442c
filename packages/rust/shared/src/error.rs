//! Error types for pdfpipe.
//!
//! Library crates use [`PipelineError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Maximum number of characters of a remote response body kept in an error.
pub const ERROR_BODY_LIMIT: usize = 500;

/// Top-level error type for all pdfpipe operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Chunk size/overlap combination is unusable.
    #[error("invalid chunking params: {message}")]
    InvalidChunkParams { message: String },

    /// A document carries a status this pipeline does not understand.
    #[error("invalid status: {status}")]
    InvalidStatus { status: String },

    /// The driver hit its iteration cap without reaching `completed`.
    #[error("pipeline stalled for document {document_id} after {iterations} iterations")]
    PipelineStalled {
        document_id: String,
        iterations: usize,
    },

    /// Non-success response from the conversion service.
    #[error("conversion service error ({status}): {body}")]
    ConversionService { status: u16, body: String },

    /// The requested document does not exist.
    #[error("document not found: {id}")]
    NotFound { id: String },

    /// A download exceeded its byte cap.
    #[error("payload too large: {size} bytes exceeds max_bytes={limit}")]
    PayloadTooLarge { size: u64, limit: u64 },

    /// A download exceeded its time budget.
    #[error("timed out after {seconds}s: {what}")]
    Timeout { what: String, seconds: u64 },

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP transport error.
    #[error("network error: {0}")]
    Network(String),

    /// HTML or PDF parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Blob store error.
    #[error("blob store error: {0}")]
    Blob(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a chunk-parameter error.
    pub fn chunk_params(msg: impl Into<String>) -> Self {
        Self::InvalidChunkParams {
            message: msg.into(),
        }
    }

    /// Create a not-found error for a document id.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a conversion-service error, truncating the body for diagnostics.
    pub fn conversion_service(status: u16, body: &str) -> Self {
        Self::ConversionService {
            status,
            body: body.chars().take(ERROR_BODY_LIMIT).collect(),
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout { .. } => true,
            Self::ConversionService { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = PipelineError::config("database path not set");
        assert_eq!(err.to_string(), "config error: database path not set");

        let err = PipelineError::chunk_params("chunkOverlap (200) must be < chunkSize (100)");
        assert!(err.to_string().starts_with("invalid chunking params"));
    }

    #[test]
    fn conversion_body_is_truncated() {
        let body = "x".repeat(2_000);
        let err = PipelineError::conversion_service(502, &body);
        match err {
            PipelineError::ConversionService { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body.chars().count(), ERROR_BODY_LIMIT);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn transient_classification() {
        assert!(PipelineError::Network("reset".into()).is_transient());
        assert!(PipelineError::conversion_service(503, "").is_transient());
        assert!(PipelineError::conversion_service(429, "").is_transient());
        assert!(!PipelineError::conversion_service(400, "").is_transient());
        assert!(!PipelineError::not_found("x").is_transient());
    }
}
