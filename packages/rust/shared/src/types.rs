//! Core domain types for pdfpipe documents and their chunk rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

// ---------------------------------------------------------------------------
// DocumentId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for document identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    /// Generate a new time-sortable document identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// DocumentStatus
// ---------------------------------------------------------------------------

/// Pipeline status of a document. The status alone decides which stage runs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DocumentStatus {
    Uploaded,
    Pending,
    Failed,
    PdfToHtml,
    CleanupHtml,
    HtmlToMd,
    ExtractPdfText,
    Completed,
}

impl DocumentStatus {
    /// Every status, in pipeline order.
    pub const ALL: [DocumentStatus; 8] = [
        Self::Uploaded,
        Self::Pending,
        Self::Failed,
        Self::PdfToHtml,
        Self::CleanupHtml,
        Self::HtmlToMd,
        Self::ExtractPdfText,
        Self::Completed,
    ];

    /// Statuses a worker may claim into the pipeline.
    pub const CLAIMABLE: [DocumentStatus; 3] = [Self::Uploaded, Self::Pending, Self::Failed];

    /// Statuses that mean a stage is (or was) executing.
    pub const PROCESSING: [DocumentStatus; 4] = [
        Self::PdfToHtml,
        Self::CleanupHtml,
        Self::HtmlToMd,
        Self::ExtractPdfText,
    ];

    /// First stage entered from a claimable status.
    pub const ENTRY: DocumentStatus = Self::PdfToHtml;

    /// Wire representation stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::PdfToHtml => "processing:pdf_to_html",
            Self::CleanupHtml => "processing:cleanup_html",
            Self::HtmlToMd => "processing:html_to_md",
            Self::ExtractPdfText => "processing:extract_pdf_text",
            Self::Completed => "completed",
        }
    }

    /// Status written after this stage commits successfully.
    ///
    /// `None` for statuses that are not stages (claimable and terminal ones).
    pub fn next(self) -> Option<DocumentStatus> {
        match self {
            Self::PdfToHtml => Some(Self::CleanupHtml),
            Self::CleanupHtml => Some(Self::HtmlToMd),
            Self::HtmlToMd => Some(Self::ExtractPdfText),
            Self::ExtractPdfText => Some(Self::Completed),
            Self::Uploaded | Self::Pending | Self::Failed | Self::Completed => None,
        }
    }

    /// Whether a worker may claim a document in this status.
    pub fn is_claimable(self) -> bool {
        Self::CLAIMABLE.contains(&self)
    }

    /// Whether this status names a stage.
    pub fn is_processing(self) -> bool {
        Self::PROCESSING.contains(&self)
    }

    /// Whether no further work remains.
    pub fn is_terminal(self) -> bool {
        self == Self::Completed
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DocumentStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| PipelineError::InvalidStatus {
                status: s.to_string(),
            })
    }
}

impl TryFrom<String> for DocumentStatus {
    type Error = PipelineError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DocumentStatus> for String {
    fn from(status: DocumentStatus) -> Self {
        status.as_str().to_string()
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// A submitted PDF and everything the pipeline has produced for it so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub owner_id: String,
    pub filename: String,
    /// Blob key of the original PDF.
    pub source_key: String,
    pub status: DocumentStatus,
    /// Stage that was executing when the document last failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<DocumentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_chunk_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown_chunk_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown_char_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_html_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clean_html_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown_key: Option<String>,
    /// Full markdown, kept inline only when it is small enough.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown_text: Option<String>,
    /// Leading slice of the markdown when it is too large to inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markdown_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields supplied by the upload path when a document is first recorded.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub owner_id: String,
    pub filename: String,
    pub source_key: String,
}

// ---------------------------------------------------------------------------
// Chunk rows
// ---------------------------------------------------------------------------

/// One byte-bounded slice of a document's markdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkdownChunk {
    pub document_id: String,
    pub chunk_index: u32,
    pub text: String,
    pub char_count: u32,
}

/// One overlapping slice of a single page's text layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub document_id: String,
    /// 1-based page number.
    pub page_number: u32,
    /// Index within the page.
    pub chunk_index: u32,
    pub text: String,
    pub char_count: u32,
}
