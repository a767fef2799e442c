//! Plain-text extraction from a PDF's text layer.
//!
//! Each page's text is whitespace-normalized and chunked on its own, so every
//! [`TextChunk`] belongs to exactly one page. Pages without text produce no
//! chunks; a document without any text layer yields zero chunks, not an error.

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use pdfpipe_chunking::{ChunkParams, chunk_with, normalize_whitespace};
use pdfpipe_shared::{PipelineError, Result, TextChunk};

// ---------------------------------------------------------------------------
// Parser boundary
// ---------------------------------------------------------------------------

/// Raw per-page text as reported by a parser.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPages {
    /// Page texts in page order.
    pub pages: Vec<String>,
    /// Page count as reported by the parser.
    pub page_count: u32,
}

/// Reads the text layer of a PDF.
#[async_trait]
pub trait TextLayerParser: Send + Sync {
    fn name(&self) -> &'static str;

    async fn parse(&self, pdf: Vec<u8>) -> Result<ParsedPages>;
}

/// Text-layer parser backed by `pdf-extract`, run on the blocking pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfExtractParser;

#[async_trait]
impl TextLayerParser for PdfExtractParser {
    fn name(&self) -> &'static str {
        "pdf-extract"
    }

    async fn parse(&self, pdf: Vec<u8>) -> Result<ParsedPages> {
        let joined =
            tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem_by_pages(&pdf))
                .await;

        let pages = match joined {
            Ok(Ok(pages)) => pages,
            Ok(Err(e)) => return Err(PipelineError::parse(format!("pdf text extraction failed: {e}"))),
            // pdf-extract panics on some malformed files
            Err(e) if e.is_panic() => {
                return Err(PipelineError::parse("pdf text extraction panicked on malformed input"));
            }
            Err(e) => return Err(PipelineError::parse(format!("pdf text extraction aborted: {e}"))),
        };

        Ok(ParsedPages {
            page_count: pages.len() as u32,
            pages,
        })
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Extraction result for one document.
#[derive(Debug, Clone)]
pub struct ExtractedText {
    pub page_count: u32,
    pub chunks: Vec<TextChunk>,
}

/// Parse `pdf` and chunk every page independently.
///
/// Page numbers are 1-based; chunk indexes restart at 0 on each page.
#[instrument(skip(parser, pdf, params), fields(parser = parser.name(), bytes = pdf.len()))]
pub async fn extract_text(
    parser: &dyn TextLayerParser,
    document_id: &str,
    pdf: Vec<u8>,
    params: ChunkParams,
) -> Result<ExtractedText> {
    let parsed = parser.parse(pdf).await?;
    let chunks = chunk_pages(document_id, &parsed.pages, params);

    info!(
        page_count = parsed.page_count,
        chunks = chunks.len(),
        "extracted text layer"
    );
    Ok(ExtractedText {
        page_count: parsed.page_count,
        chunks,
    })
}

fn chunk_pages(document_id: &str, pages: &[String], params: ChunkParams) -> Vec<TextChunk> {
    let mut out = Vec::new();
    for (page_idx, raw) in pages.iter().enumerate() {
        let text = normalize_whitespace(raw);
        if text.is_empty() {
            debug!(page = page_idx + 1, "page has no text");
            continue;
        }
        for (chunk_index, piece) in chunk_with(&text, params).into_iter().enumerate() {
            out.push(TextChunk {
                document_id: document_id.to_string(),
                page_number: page_idx as u32 + 1,
                chunk_index: chunk_index as u32,
                text: piece.to_string(),
                char_count: piece.chars().count() as u32,
            });
        }
    }
    out
}
