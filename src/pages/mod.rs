//! Splitting documents into single-page units, and putting them back together.
//!
//! A document worker owns every file these traits produce. The splitter writes
//! into a scratch directory the worker hands it, and the worker deletes that
//! directory when it is done with the document, however it finishes.

use crate::{errors::PipelineError, prelude::*};

pub mod poppler;

/// One page extracted from a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageUnit {
    /// 0-based index of this page within the source document.
    pub index: usize,

    /// A single-page document in the worker's scratch directory.
    pub path: PathBuf,
}

/// The recognized form of a [`PageUnit`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessedPage {
    /// 0-based index of the source page.
    pub index: usize,

    /// A single-page document containing the recognized page.
    pub path: PathBuf,
}

/// Splits a multi-page document into single-page documents.
#[async_trait]
pub trait PageSplitter: Send + Sync + 'static {
    /// Split `source` into one file per page, written under `scratch_dir`.
    ///
    /// The returned pages are in source order, with `index` running from 0 to
    /// N-1. On error, no pages are returned, and anything already written to
    /// `scratch_dir` is left for the caller to delete.
    async fn split(&self, source: &Path, scratch_dir: &Path) -> Result<Vec<PageUnit>>;
}

/// Concatenates processed single-page documents.
#[async_trait]
pub trait Reassembler: Send + Sync + 'static {
    /// Write `pages` to `output`, in the order given. Callers should run
    /// [`check_complete`] first.
    async fn reassemble(&self, pages: &[ProcessedPage], output: &Path) -> Result<()>;
}

/// Make sure `pages` contains every page from 0 to `total_pages - 1`, in
/// order, and that each processed file actually exists.
pub fn check_complete(
    document: &str,
    pages: &[ProcessedPage],
    total_pages: usize,
) -> Result<(), PipelineError> {
    for expected in 0..total_pages {
        let present = pages
            .get(expected)
            .is_some_and(|page| page.index == expected && page.path.is_file());
        if !present {
            return Err(PipelineError::ReassemblyIncomplete {
                document: document.to_owned(),
                missing_page: expected,
            });
        }
    }
    if pages.len() > total_pages {
        warn!(
            document,
            total_pages,
            received = pages.len(),
            "More processed pages than expected; extra pages will be ignored"
        );
    }
    Ok(())
}
