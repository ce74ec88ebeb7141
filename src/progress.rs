//! Live per-document progress for one session.
//!
//! Each document worker is the only writer for its own entry, but status
//! pollers may read the whole table at any moment. Everything sits behind one
//! [`Mutex`], and we only ever hold it long enough to update or copy a few
//! small records.
//!
//! Two rules keep polling clients sane:
//!
//! 1. Every document gets an entry when the table is created, before any
//!    worker starts, so "not started yet" is never confused with "missing".
//! 2. `pages_done` never decreases, so neither does `percent`, and a terminal
//!    [`DocumentState`] is never replaced.

use std::{collections::BTreeMap, sync::Mutex};

use crate::prelude::*;

/// Identifies a document within a session: its position in the submitted list.
pub type DocumentId = usize;

/// A point-in-time copy of a session's progress table.
pub type ProgressSnapshot = BTreeMap<DocumentId, DocumentProgress>;

/// Where a document is in its lifecycle.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    /// Waiting for a free worker.
    Pending,
    /// Being split into pages.
    Splitting,
    /// Pages are being recognized, one at a time.
    Processing,
    /// Processed pages are being joined back together.
    Reassembling,
    /// An output document was produced.
    Succeeded,
    /// No output document will be produced. See `error`.
    Failed,
    /// The session was cancelled before this document finished.
    Cancelled,
}

impl DocumentState {
    /// Will this state ever change again?
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Progress view of one document.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DocumentProgress {
    /// The original file name.
    pub display_name: String,

    /// Number of pages, or 0 if we haven't split the document yet.
    pub total_pages: usize,

    /// Number of pages recognized so far.
    pub pages_done: usize,

    /// `pages_done / total_pages`, as a percentage from 0 to 100.
    pub percent: f64,

    /// Lifecycle state.
    pub state: DocumentState,

    /// Why the document failed. Under
    /// [`crate::pipeline::FailurePolicy::SkipAndContinue`], a succeeded
    /// document may also carry the errors for pages it passed through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DocumentProgress {
    fn new(display_name: String) -> Self {
        Self {
            display_name,
            total_pages: 0,
            pages_done: 0,
            percent: 0.0,
            state: DocumentState::Pending,
            error: None,
        }
    }

    fn recompute_percent(&mut self) {
        self.percent = if self.total_pages == 0 {
            0.0
        } else {
            (self.pages_done as f64 / self.total_pages as f64 * 100.0).min(100.0)
        };
    }
}

/// The progress table for one session.
#[derive(Debug)]
pub struct SessionProgress {
    documents: Mutex<ProgressSnapshot>,
}

impl SessionProgress {
    /// Create a table with one pending entry per document name. Document IDs
    /// are positions in `display_names`.
    pub fn initialize<I>(display_names: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let documents = display_names
            .into_iter()
            .enumerate()
            .map(|(id, name)| (id, DocumentProgress::new(name)))
            .collect();
        Self {
            documents: Mutex::new(documents),
        }
    }

    /// Run `f` on one entry while holding the lock.
    fn with_document(&self, id: DocumentId, f: impl FnOnce(&mut DocumentProgress)) {
        let mut documents = self.documents.lock().expect("lock poisoned");
        match documents.get_mut(&id) {
            Some(document) => f(document),
            None => warn!(document_id = id, "progress update for unknown document"),
        }
    }

    /// Move a document to a non-terminal state. Ignored once the document is
    /// terminal.
    pub fn set_state(&self, id: DocumentId, state: DocumentState) {
        self.with_document(id, |document| {
            if !document.state.is_terminal() {
                document.state = state;
            }
        });
    }

    /// Record page progress. `pages_done` is clamped to `total_pages`, and
    /// smaller values than we've already seen are ignored.
    pub fn update(&self, id: DocumentId, pages_done: usize, total_pages: usize) {
        self.with_document(id, |document| {
            if document.state.is_terminal() {
                return;
            }
            if total_pages > 0 {
                document.total_pages = total_pages;
            }
            document.pages_done = document
                .pages_done
                .max(pages_done)
                .min(document.total_pages);
            document.recompute_percent();
        });
    }

    /// Record a terminal state. The first terminal state wins.
    pub fn finish(&self, id: DocumentId, state: DocumentState, error: Option<String>) {
        debug_assert!(state.is_terminal(), "finish called with {state:?}");
        self.with_document(id, |document| {
            if document.state.is_terminal() {
                return;
            }
            document.state = state;
            document.error = error;
        });
    }

    /// Fail every document that hasn't reached a terminal state. Used when a
    /// worker disappears without reporting back.
    pub fn fail_unfinished(&self, reason: &str) {
        let mut documents = self.documents.lock().expect("lock poisoned");
        for document in documents.values_mut() {
            if !document.state.is_terminal() {
                document.state = DocumentState::Failed;
                document.error = Some(reason.to_owned());
            }
        }
    }

    /// Copy the current table.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.documents.lock().expect("lock poisoned").clone()
    }

    /// Has every document reached a terminal state?
    pub fn all_terminal(&self) -> bool {
        let documents = self.documents.lock().expect("lock poisoned");
        documents.values().all(|document| document.state.is_terminal())
    }

    /// Has every document reached 100%?
    pub fn all_complete(&self) -> bool {
        let documents = self.documents.lock().expect("lock poisoned");
        documents
            .values()
            .all(|document| document.total_pages > 0 && document.pages_done == document.total_pages)
    }
}
