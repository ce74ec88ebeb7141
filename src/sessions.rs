//! Session-scoped state, and the registry that tracks live sessions.
//!
//! Each batch gets a [`SessionContext`] holding its progress table, cancel
//! flag and bundling result. Workers are handed an `Arc<SessionContext>`
//! directly instead of looking things up by session ID, and the
//! [`SessionRegistry`] only exists so that pollers can find a session and so
//! that finished sessions can be released.

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::{
    cancel::CancelFlag,
    errors::PipelineError,
    prelude::*,
    progress::SessionProgress,
};

/// An opaque, caller-supplied session identifier.
///
/// Session IDs end up in file names, so they are limited to ASCII letters,
/// digits, `-` and `_`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Longest ID we accept.
    const MAX_LEN: usize = 128;

    /// Generate a fresh random session ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() || s.len() > Self::MAX_LEN {
            return Err(anyhow!(
                "session IDs must be between 1 and {} characters",
                Self::MAX_LEN
            ));
        }
        if !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(anyhow!(
                "session ID {:?} may only contain letters, digits, '-' and '_'",
                s
            ));
        }
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a session is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Registered, but the coordinator hasn't started yet.
    Accepted,
    /// Document workers are running.
    Running,
    /// Every worker has finished; bundling is in progress.
    AllWorkersDone,
    /// Bundling has finished (possibly with an error).
    Bundled,
}

/// The result of bundling a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BundleState {
    /// An archive was written.
    Ready {
        path: PathBuf,
        /// Names of the documents inside the archive.
        entries: Vec<String>,
    },
    /// No document succeeded, so there is nothing to download.
    Empty,
    /// Writing the archive failed.
    Failed(String),
}

/// What happened when cancellation was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAck {
    /// The flag is now set; workers will stop at their next page boundary.
    Requested,
    /// Someone already asked.
    AlreadyRequested,
    /// Every worker had already finished, so there was nothing to stop.
    AlreadyFinished,
}

/// Mutable session status, guarded by a single lock.
#[derive(Debug)]
struct SessionStatus {
    phase: SessionPhase,
    bundle: Option<BundleState>,
    finished_at: Option<Instant>,
}

/// Everything the pipeline knows about one batch.
#[derive(Debug)]
pub struct SessionContext {
    id: SessionId,
    /// Per-session directory for intermediate outputs and scratch space.
    work_dir: PathBuf,
    /// Where the archive goes.
    bundle_path: PathBuf,
    progress: SessionProgress,
    cancel: CancelFlag,
    status: Mutex<SessionStatus>,
}

impl SessionContext {
    /// Create a new session. `progress` must already have one entry per
    /// document.
    pub fn new(
        id: SessionId,
        work_dir: PathBuf,
        bundle_path: PathBuf,
        progress: SessionProgress,
    ) -> Self {
        Self {
            id,
            work_dir,
            bundle_path,
            progress,
            cancel: CancelFlag::new(),
            status: Mutex::new(SessionStatus {
                phase: SessionPhase::Accepted,
                bundle: None,
                finished_at: None,
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    pub fn progress(&self) -> &SessionProgress {
        &self.progress
    }

    /// The flag workers check between pages.
    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn phase(&self) -> SessionPhase {
        self.status.lock().expect("lock poisoned").phase
    }

    /// Advance the session's phase. Phases never move backwards.
    pub fn advance_phase(&self, phase: SessionPhase) {
        let mut status = self.status.lock().expect("lock poisoned");
        if phase_rank(phase) > phase_rank(status.phase) {
            debug!(session = %self.id, ?phase, "session phase changed");
            status.phase = phase;
        }
    }

    /// Ask every worker in this session to stop at its next page boundary.
    ///
    /// This is a no-op once all workers have finished.
    pub fn request_cancel(&self) -> CancelAck {
        // Hold the status lock so we can't race with the coordinator marking
        // the session as finished.
        let status = self.status.lock().expect("lock poisoned");
        if matches!(
            status.phase,
            SessionPhase::AllWorkersDone | SessionPhase::Bundled
        ) {
            return CancelAck::AlreadyFinished;
        }
        if self.cancel.cancel() {
            info!(session = %self.id, "cancellation requested");
            CancelAck::Requested
        } else {
            CancelAck::AlreadyRequested
        }
    }

    /// Record the result of bundling and mark the session as finished.
    pub fn finish_bundling(&self, bundle: BundleState) {
        let mut status = self.status.lock().expect("lock poisoned");
        status.phase = SessionPhase::Bundled;
        status.bundle = Some(bundle);
        status.finished_at = Some(Instant::now());
    }

    /// The result of bundling, if bundling has finished.
    pub fn bundle(&self) -> Option<BundleState> {
        self.status.lock().expect("lock poisoned").bundle.clone()
    }

    /// Has this session been finished for longer than `ttl`?
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.status
            .lock()
            .expect("lock poisoned")
            .finished_at
            .is_some_and(|finished_at| finished_at.elapsed() >= ttl)
    }
}

/// Phase ordering, for [`SessionContext::advance_phase`].
fn phase_rank(phase: SessionPhase) -> u8 {
    match phase {
        SessionPhase::Accepted => 0,
        SessionPhase::Running => 1,
        SessionPhase::AllWorkersDone => 2,
        SessionPhase::Bundled => 3,
    }
}

/// All live sessions in this process.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<SessionContext>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session. Session IDs must be unique.
    pub fn insert(&self, context: Arc<SessionContext>) -> Result<(), PipelineError> {
        let mut sessions = self.sessions.lock().expect("lock poisoned");
        if sessions.contains_key(context.id()) {
            return Err(PipelineError::SessionAlreadyExists(
                context.id().to_string(),
            ));
        }
        sessions.insert(context.id().clone(), context);
        Ok(())
    }

    /// Look up a session.
    pub fn get(&self, id: &SessionId) -> Result<Arc<SessionContext>, PipelineError> {
        self.sessions
            .lock()
            .expect("lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| PipelineError::SessionUnknown(id.to_string()))
    }

    /// Remove a session from the registry, returning it.
    pub fn remove(&self, id: &SessionId) -> Result<Arc<SessionContext>, PipelineError> {
        self.sessions
            .lock()
            .expect("lock poisoned")
            .remove(id)
            .ok_or_else(|| PipelineError::SessionUnknown(id.to_string()))
    }

    /// IDs of finished sessions older than `ttl`.
    pub fn expired(&self, ttl: Duration) -> Vec<SessionId> {
        self.sessions
            .lock()
            .expect("lock poisoned")
            .values()
            .filter(|context| context.is_expired(ttl))
            .map(|context| context.id().clone())
            .collect()
    }
}
