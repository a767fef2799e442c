//! Pipeline orchestration for pdfpipe.
//!
//! [`StageRouter`] runs one stage of one document per call; [`Pipeline`]
//! drives it for single documents and batches, recovers stale claims, and
//! owns the upload and deletion paths.

mod pipeline;
mod progress;
mod router;

pub use pipeline::{BatchSummary, DriveOutcome, Pipeline};
pub use progress::{ProgressReporter, SilentProgress};
pub use router::{Collaborators, StageRouter, StepOutcome};
