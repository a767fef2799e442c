//! Driver for the stage router: single documents, batches, stale-claim
//! recovery, plus the upload and deletion paths.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};

use pdfpipe_remote::BlobStore;
use pdfpipe_shared::{
    Document, DocumentId, DocumentStatus, NewDocument, PipelineError, PipelineSettings, Result,
};
use pdfpipe_storage::{RecoveredClaim, Storage};

use crate::progress::ProgressReporter;
use crate::router::{Collaborators, StageRouter, StepOutcome};

/// How driving one document ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    /// The document reached `completed`.
    Completed { stages_run: usize },
    /// Another worker owns the document now.
    Skipped { stages_run: usize },
}

/// Summary of a [`Pipeline::run_batch`] run.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    /// Documents picked up.
    pub attempted: usize,
    pub completed: usize,
    pub skipped: usize,
    /// Failed documents (id, error message).
    pub failed: Vec<(String, String)>,
}

/// Stage router plus the operations that drive it.
pub struct Pipeline {
    router: StageRouter,
    storage: Arc<Storage>,
    blobs: Arc<dyn BlobStore>,
    progress: Arc<dyn ProgressReporter>,
    max_iterations: usize,
}

impl Pipeline {
    pub fn new(deps: Collaborators, settings: PipelineSettings) -> Result<Self> {
        let storage = deps.storage.clone();
        let blobs = deps.blobs.clone();
        let progress = deps.progress.clone();
        let max_iterations = settings.max_iterations;
        Ok(Self {
            router: StageRouter::new(deps, settings)?,
            storage,
            blobs,
            progress,
            max_iterations,
        })
    }

    pub fn router(&self) -> &StageRouter {
        &self.router
    }

    /// Step document `id` until it completes, bounded by the iteration cap.
    ///
    /// Exceeding the cap is [`PipelineError::PipelineStalled`].
    #[instrument(skip(self), fields(document_id = id))]
    pub async fn drive(&self, id: &str) -> Result<DriveOutcome> {
        let mut stages_run = 0;
        for _ in 0..self.max_iterations {
            match self.router.step(id).await? {
                StepOutcome::Advanced { .. } => stages_run += 1,
                StepOutcome::Done => return Ok(DriveOutcome::Completed { stages_run }),
                StepOutcome::Skipped => return Ok(DriveOutcome::Skipped { stages_run }),
            }
        }
        Err(PipelineError::PipelineStalled {
            document_id: id.to_string(),
            iterations: self.max_iterations,
        })
    }

    /// Drive `id`, reporting the result to the progress reporter.
    pub async fn process_one(&self, id: &str) -> Result<DriveOutcome> {
        let result = self.drive(id).await;
        match &result {
            Ok(outcome) => self.progress.document_finished(id, outcome),
            Err(e) => self.progress.document_failed(id, e),
        }
        result
    }

    /// Drive up to `limit` claimable documents, oldest first.
    ///
    /// A document's failure is logged and counted; it never aborts the batch.
    #[instrument(skip(self))]
    pub async fn run_batch(&self, limit: u32) -> Result<BatchSummary> {
        let ids = self.storage.list_claimable(limit).await?;
        let mut summary = BatchSummary {
            attempted: ids.len(),
            ..BatchSummary::default()
        };

        if ids.is_empty() {
            info!("no documents to process");
            return Ok(summary);
        }

        for id in ids {
            match self.process_one(&id).await {
                Ok(DriveOutcome::Completed { stages_run }) => {
                    info!(document_id = %id, stages_run, "document completed");
                    summary.completed += 1;
                }
                Ok(DriveOutcome::Skipped { .. }) => summary.skipped += 1,
                Err(e) => {
                    warn!(document_id = %id, error = %e, "document failed");
                    summary.failed.push((id, e.to_string()));
                }
            }
        }

        info!(
            attempted = summary.attempted,
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed.len(),
            "batch finished"
        );
        Ok(summary)
    }

    /// Reset documents stuck in `processing:*` for longer than `older_than` to `pending`.
    #[instrument(skip(self))]
    pub async fn recover_stale(&self, older_than: Duration) -> Result<Vec<RecoveredClaim>> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| PipelineError::validation(format!("invalid recovery age: {e}")))?;
        let recovered = self.storage.reset_stale(Utc::now() - age).await?;
        info!(recovered = recovered.len(), "stale claim recovery finished");
        Ok(recovered)
    }

    /// Store an uploaded PDF and record it as `uploaded`.
    #[instrument(skip(self, pdf), fields(bytes = pdf.len()))]
    pub async fn submit(&self, owner_id: &str, filename: &str, pdf: &[u8]) -> Result<Document> {
        let filename = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| PipelineError::validation(format!("invalid filename: {filename:?}")))?;

        let source_key = format!("uploads/{owner_id}/{}/{filename}", DocumentId::new());
        self.blobs.put(pdf, &source_key).await?;

        let doc = self
            .storage
            .insert_document(&NewDocument {
                owner_id: owner_id.to_string(),
                filename: filename.to_string(),
                source_key,
            })
            .await?;
        info!(document_id = %doc.id, "document submitted");
        Ok(doc)
    }

    /// Delete a document, its chunk rows and its blobs.
    ///
    /// Rows go first, in one transaction; blob removal is best effort.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        let doc = self
            .storage
            .get_document(id)
            .await?
            .ok_or_else(|| PipelineError::not_found(id))?;
        if doc.status.is_processing() {
            warn!(document_id = id, status = %doc.status, "deleting a document mid-stage");
        }

        if !self.storage.delete_document(id).await? {
            return Err(PipelineError::not_found(id));
        }

        let keys = [Some(doc.source_key), doc.raw_html_key, doc.clean_html_key, doc.markdown_key];
        for key in keys.into_iter().flatten() {
            if let Err(e) = self.blobs.delete(&key).await {
                warn!(document_id = id, key = %key, error = %e, "failed to delete blob");
            }
        }
        Ok(())
    }

    /// Document counts per status.
    pub async fn status_counts(&self) -> Result<Vec<(DocumentStatus, u64)>> {
        self.storage.count_by_status().await
    }
}
