//! Errors reported by the document pipeline.
//!
//! Most internal plumbing uses [`anyhow::Result`]. Failures that callers need
//! to tell apart (a corrupt document versus an unknown session, say) are
//! converted into a [`PipelineError`] at the boundary of each pipeline stage.
//! Per-document failures are recorded in the progress table, and only
//! session-level failures are returned from [`crate::service::OcrService`].

use thiserror::Error;

/// Everything that can go wrong in a batch, from the caller's point of view.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// The document could not be opened, or we couldn't count its pages.
    #[error("{document:?} could not be split into pages: {detail}")]
    DocumentCorrupt { document: String, detail: String },

    /// The recognition engine failed on one page.
    #[error("recognition failed on page {} of {document:?}: {detail}", .page + 1)]
    RecognitionFailed {
        document: String,
        /// 0-based page index.
        page: usize,
        detail: String,
    },

    /// A processed page was missing when we tried to reassemble.
    #[error("cannot reassemble {document:?}: processed page {} is missing", .missing_page + 1)]
    ReassemblyIncomplete {
        document: String,
        /// 0-based page index.
        missing_page: usize,
    },

    /// All pages were present, but the reassembly tool failed.
    #[error("failed to reassemble {document:?}: {detail}")]
    ReassemblyFailed { document: String, detail: String },

    /// The worker couldn't set up or read its own files.
    #[error("I/O error while processing {document:?}: {detail}")]
    DocumentIo { document: String, detail: String },

    #[error("unknown session {0:?}")]
    SessionUnknown(String),

    #[error("session {0:?} already exists")]
    SessionAlreadyExists(String),

    #[error("session {0:?} is still processing")]
    SessionBusy(String),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// Bundling hasn't finished, or no document succeeded.
    #[error("no bundle is available for session {0:?}")]
    BundleNotFound(String),

    /// Writing or reading the archive failed (disk full, for example).
    #[error("bundling failed for session {session:?}: {detail}")]
    BundleFailed { session: String, detail: String },
}

impl PipelineError {
    /// Render an [`anyhow::Error`] with its full context chain, for use as a
    /// `detail` field.
    pub fn detail(err: &anyhow::Error) -> String {
        format!("{err:#}")
    }
}
