//! Stage router: one claim → execute → advance step per call.
//!
//! A document's status is the only record of what runs next. A claimable
//! document (`uploaded`, `pending`, `failed`) is first moved into its entry
//! stage with a compare-and-swap; the stage's work then runs and its outputs
//! are committed together with the advance, which is itself conditional on
//! the document still being in that stage. Losing either race is a no-op.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use pdfpipe_chunking::{ChunkParams, chunk_bytes};
use pdfpipe_extract::{TextLayerParser, extract_text};
use pdfpipe_normalize::HtmlNormalizer;
use pdfpipe_remote::{BlobStore, ConversionInput, Converter, DownloadLimits, Downloader, Format};
use pdfpipe_shared::{
    Document, DocumentId, DocumentStatus, MarkdownChunk, PipelineError, PipelineSettings, Result,
    RetryPolicy,
};
use pdfpipe_storage::{MarkdownOutput, StageOutputs, Storage, TextOutput};

use crate::progress::{ProgressReporter, SilentProgress};

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// External collaborators injected into the router.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<Storage>,
    pub blobs: Arc<dyn BlobStore>,
    /// Converter for pdf → html.
    pub pdf_converter: Arc<dyn Converter>,
    /// Converter for html → md.
    pub markdown_converter: Arc<dyn Converter>,
    pub parser: Arc<dyn TextLayerParser>,
    pub normalizer: Arc<dyn HtmlNormalizer>,
    pub downloader: Downloader,
    pub progress: Arc<dyn ProgressReporter>,
}

impl Collaborators {
    /// Replace the progress reporter.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Collaborators with a [`SilentProgress`] reporter.
    pub fn new(
        storage: Arc<Storage>,
        blobs: Arc<dyn BlobStore>,
        pdf_converter: Arc<dyn Converter>,
        markdown_converter: Arc<dyn Converter>,
        parser: Arc<dyn TextLayerParser>,
        normalizer: Arc<dyn HtmlNormalizer>,
        downloader: Downloader,
    ) -> Self {
        Self {
            storage,
            blobs,
            pdf_converter,
            markdown_converter,
            parser,
            normalizer,
            downloader,
            progress: Arc::new(SilentProgress),
        }
    }
}

// ---------------------------------------------------------------------------
// Blob keys
// ---------------------------------------------------------------------------

// Every stage run writes under its own attempt id, so a run that loses the
// commit never overwrites blobs a committed row points at.

fn attempt_prefix(document_id: &str) -> String {
    format!("documents/{document_id}/{}", DocumentId::new())
}

fn raw_html_key(document_id: &str) -> String {
    format!("{}/raw.html", attempt_prefix(document_id))
}

fn clean_html_key(document_id: &str) -> String {
    format!("{}/clean.html", attempt_prefix(document_id))
}

fn markdown_key(document_id: &str) -> String {
    format!("{}/document.md", attempt_prefix(document_id))
}

/// Blob key written by a stage, if any.
fn written_key(outputs: &StageOutputs) -> Option<&str> {
    match outputs {
        StageOutputs::RawHtml { key } | StageOutputs::CleanHtml { key } => Some(key),
        StageOutputs::Markdown(out) => Some(&out.key),
        StageOutputs::Text(_) => None,
    }
}

/// Blob key the document recorded for `stage` before this run.
fn committed_key(doc: &Document, stage: DocumentStatus) -> Option<&str> {
    match stage {
        DocumentStatus::PdfToHtml => doc.raw_html_key.as_deref(),
        DocumentStatus::CleanupHtml => doc.clean_html_key.as_deref(),
        DocumentStatus::HtmlToMd => doc.markdown_key.as_deref(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Result of one [`StageRouter::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A stage ran and the document moved from `from` to `to`.
    Advanced {
        from: DocumentStatus,
        to: DocumentStatus,
    },
    /// The document is `completed`; nothing ran.
    Done,
    /// Another worker claimed or committed first; nothing was written.
    Skipped,
}

/// Executes exactly one pipeline stage per call.
pub struct StageRouter {
    deps: Collaborators,
    settings: PipelineSettings,
    chunk_params: ChunkParams,
}

impl StageRouter {
    /// Validates the chunking settings up front.
    pub fn new(deps: Collaborators, settings: PipelineSettings) -> Result<Self> {
        let chunk_params = ChunkParams::new(settings.chunk_size, settings.chunk_overlap)?;
        if settings.markdown_chunk_bytes == 0 {
            return Err(PipelineError::chunk_params("markdown chunk bytes must be positive"));
        }
        Ok(Self {
            deps,
            settings,
            chunk_params,
        })
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run the next stage of document `id`.
    ///
    /// Stage failures are recorded on the document (`failed`, `last_error`,
    /// `failed_stage`) and then returned.
    #[instrument(skip(self), fields(document_id = id))]
    pub async fn step(&self, id: &str) -> Result<StepOutcome> {
        let doc = self
            .deps
            .storage
            .get_document(id)
            .await?
            .ok_or_else(|| PipelineError::not_found(id))?;

        let stage = match doc.status {
            DocumentStatus::Completed => return Ok(StepOutcome::Done),
            status if status.is_claimable() => {
                let target = self.entry_stage(&doc).await;
                if !self.deps.storage.claim(id, target).await? {
                    debug!(%status, "claim lost to another worker");
                    return Ok(StepOutcome::Skipped);
                }
                info!(from = %status, to = %target, "claimed document");
                target
            }
            status => status,
        };

        self.run_stage(&doc, stage).await
    }

    /// Stage a claimable document enters, per the retry policy.
    async fn entry_stage(&self, doc: &Document) -> DocumentStatus {
        if self.settings.retry_policy == RetryPolicy::Restart || doc.status != DocumentStatus::Failed
        {
            return DocumentStatus::ENTRY;
        }
        let Some(failed) = doc.failed_stage else {
            return DocumentStatus::ENTRY;
        };

        let prerequisite = match failed {
            DocumentStatus::CleanupHtml => doc.raw_html_key.as_deref(),
            DocumentStatus::HtmlToMd => doc.clean_html_key.as_deref(),
            // Only needs the source PDF.
            DocumentStatus::ExtractPdfText => return failed,
            _ => return DocumentStatus::ENTRY,
        };

        // presign doubles as an existence check
        match prerequisite {
            Some(key) if self.deps.blobs.presign(key, self.settings.presign_expiry).await.is_ok() => {
                debug!(stage = %failed, "resuming at failed stage");
                failed
            }
            _ => DocumentStatus::ENTRY,
        }
    }

    async fn run_stage(&self, doc: &Document, stage: DocumentStatus) -> Result<StepOutcome> {
        let next = stage.next().ok_or_else(|| PipelineError::InvalidStatus {
                status: stage.to_string(),
            })?;

        self.deps.progress.stage_started(&doc.id, stage);
        let started = Instant::now();

        let outputs = match self.execute(doc, stage).await {
            Ok(outputs) => outputs,
            Err(e) => {
                self.record_failure(&doc.id, stage, &e).await;
                return Err(e);
            }
        };
        let written = written_key(&outputs);

        let committed = match self.deps.storage.commit_stage(&doc.id, stage, &outputs).await {
            Ok(committed) => committed,
            Err(e) => {
                self.discard_blobs(&doc.id, written).await;
                self.record_failure(&doc.id, stage, &e).await;
                return Err(e);
            }
        };

        if !committed {
            debug!(%stage, "stage commit lost to another worker");
            self.discard_blobs(&doc.id, written).await;
            return Ok(StepOutcome::Skipped);
        }

        // The row now points at this run's blob.
        let superseded = committed_key(doc, stage).filter(|&old| Some(old) != written);
        self.discard_blobs(&doc.id, superseded).await;

        self.deps.progress.stage_finished(&doc.id, stage, started.elapsed());
        info!(from = %stage, to = %next, elapsed_ms = started.elapsed().as_millis() as u64, "stage committed");

        if next == DocumentStatus::Completed {
            self.discard_blobs(&doc.id, doc.raw_html_key.as_deref()).await;
            self.discard_blobs(&doc.id, doc.clean_html_key.as_deref()).await;
        }
        Ok(StepOutcome::Advanced { from: stage, to: next })
    }

    async fn record_failure(&self, id: &str, stage: DocumentStatus, error: &PipelineError) {
        warn!(document_id = id, %stage, error = %error, "stage failed");
        match self.deps.storage.mark_failed(id, stage, &error.to_string()).await {
            Ok(true) => {}
            Ok(false) => debug!(document_id = id, "document left the stage before failure was recorded"),
            Err(e) => warn!(document_id = id, error = %e, "failed to record stage failure"),
        }
    }

    /// Best-effort blob removal.
    async fn discard_blobs(&self, id: &str, key: Option<&str>) {
        let Some(key) = key else { return };
        if let Err(e) = self.deps.blobs.delete(key).await {
            warn!(document_id = id, key, error = %e, "failed to delete blob");
        }
    }

    // -----------------------------------------------------------------------
    // Stage work
    // -----------------------------------------------------------------------

    async fn execute(&self, doc: &Document, stage: DocumentStatus) -> Result<StageOutputs> {
        match stage {
            DocumentStatus::PdfToHtml => self.pdf_to_html(doc).await,
            DocumentStatus::CleanupHtml => self.cleanup_html(doc).await,
            DocumentStatus::HtmlToMd => self.html_to_md(doc).await,
            DocumentStatus::ExtractPdfText => self.extract_pdf_text(doc).await,
            other => Err(PipelineError::InvalidStatus {
                status: other.to_string(),
            }),
        }
    }

    async fn pdf_to_html(&self, doc: &Document) -> Result<StageOutputs> {
        let url = self
            .deps
            .blobs
            .presign(&doc.source_key, self.settings.presign_expiry)
            .await?;

        // A remote service can only fetch http(s) URLs itself.
        let input = match url.scheme() {
            "http" | "https" => ConversionInput::Url(url),
            _ => ConversionInput::Bytes {
                data: self.fetch_source(doc).await?,
                filename: doc.filename.clone(),
            },
        };

        let converted = self
            .deps
            .pdf_converter
            .convert(input, Format::Pdf, Format::Html)
            .await?;

        let key = raw_html_key(&doc.id);
        self.deps.blobs.put(&converted.data, &key).await?;
        debug!(bytes = converted.data.len(), converter = self.deps.pdf_converter.name(), "stored raw html");
        Ok(StageOutputs::RawHtml { key })
    }

    async fn cleanup_html(&self, doc: &Document) -> Result<StageOutputs> {
        let raw_key = doc
            .raw_html_key
            .as_deref()
            .ok_or_else(|| PipelineError::validation("raw html missing; rerun from pdf_to_html"))?;
        let raw = self.deps.blobs.get(raw_key).await?;

        let cleaned = self
            .deps
            .normalizer
            .normalize(&String::from_utf8_lossy(&raw))?;

        let key = clean_html_key(&doc.id);
        self.deps.blobs.put(cleaned.as_bytes(), &key).await?;
        debug!(
            raw_bytes = raw.len(),
            clean_bytes = cleaned.len(),
            normalizer = self.deps.normalizer.name(),
            "stored clean html"
        );
        Ok(StageOutputs::CleanHtml { key })
    }

    async fn html_to_md(&self, doc: &Document) -> Result<StageOutputs> {
        let clean_key = doc
            .clean_html_key
            .as_deref()
            .ok_or_else(|| PipelineError::validation("clean html missing; rerun from cleanup_html"))?;
        let clean = self.deps.blobs.get(clean_key).await?;

        let input = ConversionInput::Bytes {
            data: clean,
            filename: format!("clean-{}.html", doc.id),
        };
        let converted = self
            .deps
            .markdown_converter
            .convert(input, Format::Html, Format::Md)
            .await?;
        let markdown = String::from_utf8(converted.data)
            .map_err(|e| PipelineError::parse(format!("markdown is not valid UTF-8: {e}")))?;

        let chunks: Vec<MarkdownChunk> = chunk_bytes(&markdown, self.settings.markdown_chunk_bytes)?
            .into_iter()
            .enumerate()
            .map(|(i, text)| MarkdownChunk {
                document_id: doc.id.clone(),
                chunk_index: i as u32,
                text: text.to_string(),
                char_count: text.chars().count() as u32,
            })
            .collect();

        let char_count = markdown.chars().count() as u64;
        let (inline_text, preview) = if markdown.len() <= self.settings.markdown_inline_limit {
            (Some(markdown.clone()), None)
        } else {
            let preview: String = markdown.chars().take(self.settings.preview_chars).collect();
            (None, Some(preview))
        };

        let key = markdown_key(&doc.id);
        self.deps.blobs.put(markdown.as_bytes(), &key).await?;
        debug!(char_count, chunks = chunks.len(), inline = inline_text.is_some(), "stored markdown");

        Ok(StageOutputs::Markdown(MarkdownOutput {
            key,
            inline_text,
            preview,
            char_count,
            chunks,
        }))
    }

    async fn extract_pdf_text(&self, doc: &Document) -> Result<StageOutputs> {
        let pdf = self.fetch_source(doc).await?;
        let extracted =
            extract_text(self.deps.parser.as_ref(), &doc.id, pdf, self.chunk_params).await?;
        Ok(StageOutputs::Text(TextOutput {
            page_count: extracted.page_count,
            chunks: extracted.chunks,
        }))
    }

    /// Original PDF bytes, via a presigned URL when it is downloadable.
    async fn fetch_source(&self, doc: &Document) -> Result<Vec<u8>> {
        let limits = DownloadLimits::from(&self.settings);
        let url = self
            .deps
            .blobs
            .presign(&doc.source_key, self.settings.presign_expiry)
            .await?;

        match url.scheme() {
            "http" | "https" | "file" => self.deps.downloader.download(&url, limits).await,
            _ => {
                let bytes = self.deps.blobs.get(&doc.source_key).await?;
                if bytes.len() as u64 > limits.max_bytes {
                    return Err(PipelineError::PayloadTooLarge {
                        size: bytes.len() as u64,
                        limit: limits.max_bytes,
                    });
                }
                Ok(bytes)
            }
        }
    }
}
