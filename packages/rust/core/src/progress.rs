//! Progress callbacks for pipeline runs.

use std::time::Duration;

use pdfpipe_shared::{DocumentStatus, PipelineError};

use crate::pipeline::DriveOutcome;

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called before a stage's work starts.
    fn stage_started(&self, document_id: &str, stage: DocumentStatus);
    /// Called after a stage's outputs were committed.
    fn stage_finished(&self, document_id: &str, stage: DocumentStatus, elapsed: Duration);
    /// Called when driving a document ends without error.
    fn document_finished(&self, document_id: &str, outcome: &DriveOutcome);
    /// Called when driving a document ends with an error.
    fn document_failed(&self, document_id: &str, error: &PipelineError);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage_started(&self, _document_id: &str, _stage: DocumentStatus) {}
    fn stage_finished(&self, _document_id: &str, _stage: DocumentStatus, _elapsed: Duration) {}
    fn document_finished(&self, _document_id: &str, _outcome: &DriveOutcome) {}
    fn document_failed(&self, _document_id: &str, _error: &PipelineError) {}
}
