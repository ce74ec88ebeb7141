//! The batch OCR service.
//!
//! [`OcrService`] is what a front end talks to. It accepts batches, answers
//! progress polls, relays cancellation requests and hands out finished
//! bundles. It's cheap to clone, and every clone shares the same sessions.

use std::{io, sync::Arc};

use crate::{
    async_utils::JoinWorker,
    config::PipelineConfig,
    engines::{LanguageHint, page_engine_for_kind},
    errors::PipelineError,
    pages::poppler::{PopplerReassembler, PopplerSplitter},
    pipeline::{DocumentJob, PipelineTools, WorkerSettings, run_session},
    prelude::*,
    progress::{ProgressSnapshot, SessionProgress},
    sessions::{
        BundleState, CancelAck, SessionContext, SessionId, SessionPhase, SessionRegistry,
    },
};

/// A running batch.
///
/// Dropping this does not stop processing. Use
/// [`OcrService::request_cancel`] for that.
pub struct BatchHandle {
    worker: JoinWorker,
}

impl BatchHandle {
    /// Wait until every document has finished and bundling is done. Returns
    /// an error if bundling failed.
    pub async fn wait(self) -> Result<()> {
        self.worker.join().await
    }
}

/// Shared service state.
struct ServiceInner {
    config: PipelineConfig,
    tools: PipelineTools,
    sessions: SessionRegistry,
}

/// Runs batches of documents through the OCR pipeline.
#[derive(Clone)]
pub struct OcrService {
    inner: Arc<ServiceInner>,
}

impl OcrService {
    /// Create a service using the specified tools.
    pub fn new(config: PipelineConfig, tools: PipelineTools) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                config,
                tools,
                sessions: SessionRegistry::new(),
            }),
        }
    }

    /// Create a service using Poppler and the configured engine.
    pub fn from_config(config: PipelineConfig) -> Self {
        let tools = PipelineTools {
            splitter: Arc::new(PopplerSplitter::new()),
            engine: page_engine_for_kind(config.engine, &config.engine_opts()),
            reassembler: Arc::new(PopplerReassembler::new()),
        };
        Self::new(config, tools)
    }

    /// Our configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Start processing a batch. Returns as soon as every document has a
    /// progress entry, before any processing happens.
    #[instrument(level = "debug", skip(self, paths, languages), fields(documents = paths.len()))]
    pub async fn submit_batch(
        &self,
        session: SessionId,
        paths: Vec<PathBuf>,
        languages: &[String],
        concurrency_limit: usize,
    ) -> Result<BatchHandle, PipelineError> {
        let evicted = self.evict_expired().await;
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted expired sessions");
        }

        if paths.is_empty() {
            return Err(PipelineError::InvalidBatch(
                "no documents were submitted".to_owned(),
            ));
        }
        if concurrency_limit == 0 {
            return Err(PipelineError::InvalidBatch(
                "concurrency limit must be at least 1".to_owned(),
            ));
        }
        let languages = LanguageHint::new(languages.iter().cloned())
            .map_err(|err| PipelineError::InvalidBatch(PipelineError::detail(&err)))?;
        let display_names = paths
            .iter()
            .map(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        PipelineError::InvalidBatch(format!(
                            "{:?} is not a file name",
                            path.display()
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let processed_dir = &self.inner.config.processed_dir;
        let work_dir = processed_dir.join(session.as_str());
        let bundle_path = processed_dir.join(format!("{session}.zip"));
        let jobs = paths
            .into_iter()
            .zip(&display_names)
            .enumerate()
            .map(|(id, (source, display_name))| DocumentJob {
                id,
                display_name: display_name.clone(),
                source,
                output: work_dir.join(format!("{id:04}-{display_name}")),
            })
            .collect::<Vec<_>>();

        let ctx = Arc::new(SessionContext::new(
            session.clone(),
            work_dir,
            bundle_path,
            SessionProgress::initialize(display_names),
        ));
        self.inner.sessions.insert(ctx.clone())?;
        info!(%session, documents = jobs.len(), %languages, concurrency_limit, "accepted batch");

        let settings = Arc::new(WorkerSettings {
            tools: self.inner.tools.clone(),
            languages,
            failure_policy: self.inner.config.failure_policy,
        });
        let handle = tokio::spawn(async move {
            // If this fails, each document will fail to create its scratch
            // directory and say so in its progress entry.
            if let Err(err) = tokio::fs::create_dir_all(ctx.work_dir()).await {
                error!(
                    path = %ctx.work_dir().display(),
                    "cannot create session work directory: {}",
                    err
                );
            }
            run_session(ctx, jobs, settings, concurrency_limit).await
        });
        Ok(BatchHandle {
            worker: JoinWorker::from_handle(handle),
        })
    }

    /// Get the current progress of every document in a session.
    pub fn get_progress(&self, session: &SessionId) -> Result<ProgressSnapshot, PipelineError> {
        Ok(self.inner.sessions.get(session)?.progress().snapshot())
    }

    /// Ask a session's workers to stop at their next page boundary.
    pub fn request_cancel(&self, session: &SessionId) -> Result<CancelAck, PipelineError> {
        Ok(self.inner.sessions.get(session)?.request_cancel())
    }

    /// Has every document reached a terminal state, and has bundling
    /// finished?
    pub fn is_bundle_ready(&self, session: &SessionId) -> Result<bool, PipelineError> {
        let ctx = self.inner.sessions.get(session)?;
        Ok(ctx.phase() == SessionPhase::Bundled && ctx.progress().all_terminal())
    }

    /// Has every document in a session had all of its pages recognized?
    pub fn is_complete(&self, session: &SessionId) -> Result<bool, PipelineError> {
        Ok(self.inner.sessions.get(session)?.progress().all_complete())
    }

    /// Read a session's archive.
    ///
    /// This returns whatever succeeded, even if some documents failed or were
    /// cancelled.
    pub async fn fetch_bundle(&self, session: &SessionId) -> Result<Vec<u8>, PipelineError> {
        let ctx = self.inner.sessions.get(session)?;
        match ctx.bundle() {
            None | Some(BundleState::Empty) => {
                Err(PipelineError::BundleNotFound(session.to_string()))
            }
            Some(BundleState::Failed(detail)) => Err(PipelineError::BundleFailed {
                session: session.to_string(),
                detail,
            }),
            Some(BundleState::Ready { path, .. }) => {
                tokio::fs::read(&path)
                    .await
                    .map_err(|err| PipelineError::BundleFailed {
                        session: session.to_string(),
                        detail: format!("cannot read {:?}: {}", path.display(), err),
                    })
            }
        }
    }

    /// Names of the documents in a session's archive.
    pub fn bundle_entries(&self, session: &SessionId) -> Result<Vec<String>, PipelineError> {
        match self.inner.sessions.get(session)?.bundle() {
            Some(BundleState::Ready { entries, .. }) => Ok(entries),
            _ => Err(PipelineError::BundleNotFound(session.to_string())),
        }
    }

    /// Forget a finished session, deleting its archive and work directory.
    #[instrument(level = "debug", skip(self))]
    pub async fn release_session(&self, session: &SessionId) -> Result<(), PipelineError> {
        let ctx = self.inner.sessions.get(session)?;
        if ctx.phase() != SessionPhase::Bundled {
            return Err(PipelineError::SessionBusy(session.to_string()));
        }
        self.inner.sessions.remove(session)?;

        match tokio::fs::remove_file(ctx.bundle_path()).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => warn!(
                path = %ctx.bundle_path().display(),
                "failed to delete bundle: {}",
                err
            ),
            _ => {}
        }
        match tokio::fs::remove_dir_all(ctx.work_dir()).await {
            Err(err) if err.kind() != io::ErrorKind::NotFound => warn!(
                path = %ctx.work_dir().display(),
                "failed to delete work directory: {}",
                err
            ),
            _ => {}
        }
        info!(%session, "released session");
        Ok(())
    }

    /// Release every finished session older than the configured TTL.
    /// Returns the sessions we released.
    pub async fn evict_expired(&self) -> Vec<SessionId> {
        let expired = self.inner.sessions.expired(self.inner.config.session_ttl());
        let mut released = Vec::with_capacity(expired.len());
        for session in expired {
            match self.release_session(&session).await {
                Ok(()) => released.push(session),
                // Someone else released it first.
                Err(PipelineError::SessionUnknown(_)) => {}
                Err(err) => warn!(%session, "cannot evict session: {}", err),
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, io::Read as _, time::Duration};

    use zip::ZipArchive;

    use super::*;
    use crate::{
        pipeline::{
            FailurePolicy,
            testing::{FakeEngine, PAGE_BREAK, fake_tools, write_document},
        },
        progress::DocumentState,
    };

    struct Fixture {
        dir: tempfile::TempDir,
        engine: Arc<FakeEngine>,
        service: OcrService,
    }

    fn fixture_with(engine: FakeEngine, config: PipelineConfig) -> Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let engine = Arc::new(engine);
        let config = PipelineConfig {
            processed_dir: dir.path().join("processed"),
            ..config
        };
        let service = OcrService::new(config, fake_tools(engine.clone()));
        Ok(Fixture {
            dir,
            engine,
            service,
        })
    }

    fn fixture() -> Result<Fixture> {
        fixture_with(FakeEngine::default(), PipelineConfig::default())
    }

    fn eng() -> Vec<String> {
        vec!["eng".to_owned()]
    }

    fn session(id: &str) -> Result<SessionId> {
        id.parse()
    }

    /// Unpack an archive into (name, contents) pairs, sorted by name.
    fn unzip(bytes: Vec<u8>) -> Result<Vec<(String, String)>> {
        let mut archive = ZipArchive::new(io::Cursor::new(bytes))?;
        let mut files = vec![];
        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            let mut text = String::new();
            file.read_to_string(&mut text)?;
            files.push((file.name().to_owned(), text));
        }
        files.sort();
        Ok(files)
    }

    fn pages(texts: &[&str]) -> String {
        texts.join(&PAGE_BREAK.to_string())
    }

    #[tokio::test]
    async fn three_documents_all_succeed() -> Result<()> {
        let f = fixture()?;
        let docs = vec![
            write_document(f.dir.path(), "a.pdf", &["a1", "a2"])?,
            write_document(f.dir.path(), "b.pdf", &["b1", "b2", "b3"])?,
            write_document(f.dir.path(), "c.pdf", &["c1"])?,
        ];
        let id = session("s1")?;
        f.service.submit_batch(id.clone(), docs, &eng(), 2).await?.wait().await?;

        let snapshot = f.service.get_progress(&id)?;
        assert_eq!(snapshot.len(), 3);
        for (expected_pages, document) in [2, 3, 1].into_iter().zip(snapshot.values()) {
            assert_eq!(document.state, DocumentState::Succeeded);
            assert_eq!(document.total_pages, expected_pages);
            assert_eq!(document.pages_done, expected_pages);
            assert_eq!(document.percent, 100.0);
        }
        assert!(f.service.is_bundle_ready(&id)?);
        assert!(f.service.is_complete(&id)?);

        let files = unzip(f.service.fetch_bundle(&id).await?)?;
        assert_eq!(
            files,
            vec![
                ("a.pdf".to_owned(), pages(&["A1", "A2"])),
                ("b.pdf".to_owned(), pages(&["B1", "B2", "B3"])),
                ("c.pdf".to_owned(), pages(&["C1"])),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn page_failure_aborts_only_that_document() -> Result<()> {
        let f = fixture()?;
        let docs = vec![
            write_document(f.dir.path(), "bad.pdf", &["p0", "FAIL", "p2", "p3"])?,
            write_document(f.dir.path(), "good.pdf", &["g0"])?,
        ];
        let id = session("s1")?;
        f.service.submit_batch(id.clone(), docs, &eng(), 2).await?.wait().await?;

        // Pages after the failure never reach the engine.
        assert_eq!(f.engine.pages_for("bad.pdf"), vec![0, 1]);

        let snapshot = f.service.get_progress(&id)?;
        assert_eq!(snapshot[&0].state, DocumentState::Failed);
        assert_eq!(snapshot[&0].pages_done, 1);
        assert!(snapshot[&0].percent < 100.0);
        let error = snapshot[&0].error.as_deref().unwrap_or_default();
        assert!(error.contains("page 2"), "unexpected error: {error}");
        assert_eq!(snapshot[&1].state, DocumentState::Succeeded);
        assert!(f.service.is_bundle_ready(&id)?);
        assert!(!f.service.is_complete(&id)?);

        let files = unzip(f.service.fetch_bundle(&id).await?)?;
        assert_eq!(files, vec![("good.pdf".to_owned(), "G0".to_owned())]);
        Ok(())
    }

    #[tokio::test]
    async fn skip_and_continue_passes_failed_pages_through() -> Result<()> {
        let f = fixture_with(
            FakeEngine::default(),
            PipelineConfig {
                failure_policy: FailurePolicy::SkipAndContinue,
                ..PipelineConfig::default()
            },
        )?;
        let docs = vec![write_document(f.dir.path(), "a.pdf", &["p0", "FAIL", "p2"])?];
        let id = session("s1")?;
        f.service.submit_batch(id.clone(), docs, &eng(), 1).await?.wait().await?;

        assert_eq!(f.engine.pages_for("a.pdf"), vec![0, 1, 2]);
        let snapshot = f.service.get_progress(&id)?;
        assert_eq!(snapshot[&0].state, DocumentState::Succeeded);
        assert_eq!(snapshot[&0].percent, 100.0);
        assert!(snapshot[&0].error.is_some());

        let files = unzip(f.service.fetch_bundle(&id).await?)?;
        assert_eq!(
            files,
            vec![("a.pdf".to_owned(), pages(&["P0", "FAIL", "P2"]))]
        );
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_documents_fail_alone() -> Result<()> {
        let f = fixture()?;
        let docs = vec![
            write_document(f.dir.path(), "broken.pdf", &["%CORRUPT"])?,
            write_document(f.dir.path(), "fine.pdf", &["x"])?,
        ];
        let id = session("s1")?;
        f.service.submit_batch(id.clone(), docs, &eng(), 2).await?.wait().await?;

        let snapshot = f.service.get_progress(&id)?;
        assert_eq!(snapshot[&0].state, DocumentState::Failed);
        assert_eq!(snapshot[&0].total_pages, 0);
        let error = snapshot[&0].error.as_deref().unwrap_or_default();
        assert!(error.contains("could not be split"), "unexpected error: {error}");
        assert_eq!(snapshot[&1].state, DocumentState::Succeeded);
        assert!(f.engine.pages_for("broken.pdf").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn concurrency_limit_is_respected() -> Result<()> {
        let f = fixture_with(
            FakeEngine::with_delay(Duration::from_millis(20)),
            PipelineConfig::default(),
        )?;
        let docs = (0..5)
            .map(|i| write_document(f.dir.path(), &format!("{i}.pdf"), &["x", "y", "z"]))
            .collect::<Result<Vec<_>>>()?;
        let id = session("s1")?;
        f.service.submit_batch(id.clone(), docs, &eng(), 2).await?.wait().await?;

        assert_eq!(f.engine.max_in_flight(), 2);
        let snapshot = f.service.get_progress(&id)?;
        assert!(snapshot.values().all(|d| d.state == DocumentState::Succeeded));
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_stops_at_the_next_page_boundary() -> Result<()> {
        let f = fixture()?;
        let id = session("s1")?;
        {
            let service = f.service.clone();
            let id = id.clone();
            f.engine.on_page_done(move |document, page| {
                if document == "a.pdf" && page == 0 {
                    service.request_cancel(&id).expect("session should exist");
                }
            });
        }
        let docs = vec![
            write_document(f.dir.path(), "a.pdf", &["a1", "a2"])?,
            write_document(f.dir.path(), "b.pdf", &["b1"])?,
        ];
        f.service.submit_batch(id.clone(), docs, &eng(), 1).await?.wait().await?;

        let snapshot = f.service.get_progress(&id)?;
        assert_eq!(snapshot[&0].state, DocumentState::Cancelled);
        assert_eq!(snapshot[&0].pages_done, 1);
        assert_eq!(snapshot[&0].percent, 50.0);
        assert_eq!(snapshot[&1].state, DocumentState::Cancelled);
        assert_eq!(snapshot[&1].percent, 0.0);
        assert!(f.engine.pages_for("b.pdf").is_empty());

        assert!(f.service.is_bundle_ready(&id)?);
        assert_eq!(
            f.service.fetch_bundle(&id).await,
            Err(PipelineError::BundleNotFound("s1".to_owned()))
        );
        Ok(())
    }

    #[tokio::test]
    async fn documents_finished_before_cancellation_stay_in_the_bundle() -> Result<()> {
        let f = fixture()?;
        let id = session("s1")?;
        {
            let service = f.service.clone();
            let id = id.clone();
            f.engine.on_page_done(move |document, page| {
                if document == "b.pdf" && page == 0 {
                    service.request_cancel(&id).expect("session should exist");
                }
            });
        }
        let docs = vec![
            write_document(f.dir.path(), "a.pdf", &["a1"])?,
            write_document(f.dir.path(), "b.pdf", &["b1", "b2"])?,
        ];
        f.service.submit_batch(id.clone(), docs, &eng(), 1).await?.wait().await?;

        let snapshot = f.service.get_progress(&id)?;
        assert_eq!(snapshot[&0].state, DocumentState::Succeeded);
        assert_eq!(snapshot[&1].state, DocumentState::Cancelled);
        assert!(snapshot[&1].percent < 100.0);
        assert_eq!(f.engine.pages_for("b.pdf"), vec![0]);

        let files = unzip(f.service.fetch_bundle(&id).await?)?;
        assert_eq!(files, vec![("a.pdf".to_owned(), "A1".to_owned())]);
        Ok(())
    }

    #[tokio::test]
    async fn stale_archives_from_earlier_runs_are_never_served() -> Result<()> {
        let f = fixture()?;
        let processed_dir = f.service.config().processed_dir.clone();
        std::fs::create_dir_all(&processed_dir)?;
        {
            let file = std::fs::File::create(processed_dir.join("s1.zip"))?;
            let mut zip = zip::ZipWriter::new(file);
            zip.start_file("stale.pdf", zip::write::SimpleFileOptions::default())?;
            io::Write::write_all(&mut zip, b"OLD")?;
            zip.finish()?;
        }

        let docs = vec![write_document(f.dir.path(), "bad.pdf", &["%CORRUPT"])?];
        let id = session("s1")?;
        f.service.submit_batch(id.clone(), docs, &eng(), 1).await?.wait().await?;

        assert_eq!(f.service.get_progress(&id)?[&0].state, DocumentState::Failed);
        assert_eq!(
            f.service.fetch_bundle(&id).await,
            Err(PipelineError::BundleNotFound("s1".to_owned()))
        );
        assert!(!processed_dir.join("s1.zip").exists());
        Ok(())
    }

    #[tokio::test]
    async fn cancelling_a_finished_session_changes_nothing() -> Result<()> {
        let f = fixture()?;
        let docs = vec![write_document(f.dir.path(), "a.pdf", &["a1"])?];
        let id = session("s1")?;
        f.service.submit_batch(id.clone(), docs, &eng(), 1).await?.wait().await?;
        let before = f.service.get_progress(&id)?;

        assert_eq!(f.service.request_cancel(&id)?, CancelAck::AlreadyFinished);
        assert_eq!(f.service.request_cancel(&id)?, CancelAck::AlreadyFinished);
        assert_eq!(f.service.get_progress(&id)?, before);
        assert!(f.service.fetch_bundle(&id).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn every_document_is_visible_as_soon_as_submit_returns() -> Result<()> {
        let f = fixture_with(
            FakeEngine::with_delay(Duration::from_millis(10)),
            PipelineConfig::default(),
        )?;
        let docs = vec![
            write_document(f.dir.path(), "a.pdf", &["a1"])?,
            write_document(f.dir.path(), "b.pdf", &["b1"])?,
        ];
        let id = session("s1")?;
        let handle = f.service.submit_batch(id.clone(), docs, &eng(), 1).await?;

        let snapshot = f.service.get_progress(&id)?;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&0].display_name, "a.pdf");
        assert_eq!(snapshot[&1].display_name, "b.pdf");
        assert!(!f.service.is_bundle_ready(&id)?);

        handle.wait().await?;
        assert!(f.service.is_bundle_ready(&id)?);
        Ok(())
    }

    #[tokio::test]
    async fn polled_progress_never_goes_backwards() -> Result<()> {
        let f = fixture_with(
            FakeEngine::with_delay(Duration::from_millis(3)),
            PipelineConfig::default(),
        )?;
        let docs = (0..3)
            .map(|i| write_document(f.dir.path(), &format!("{i}.pdf"), &["1", "2", "3", "4"]))
            .collect::<Result<Vec<_>>>()?;
        let id = session("s1")?;
        let handle = f.service.submit_batch(id.clone(), docs, &eng(), 2).await?;

        let mut snapshots = vec![];
        while !f.service.is_bundle_ready(&id)? {
            snapshots.push(f.service.get_progress(&id)?);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        snapshots.push(f.service.get_progress(&id)?);
        handle.wait().await?;

        for pair in snapshots.windows(2) {
            for (id, earlier) in &pair[0] {
                let later = &pair[1][id];
                assert!(later.percent >= earlier.percent);
                assert!(later.percent <= 100.0);
            }
        }
        assert!(snapshots.last().is_some_and(|last| {
            last.values().all(|d| d.percent == 100.0)
        }));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_sessions_are_reported() -> Result<()> {
        let f = fixture()?;
        let id = session("nope")?;
        let unknown = PipelineError::SessionUnknown("nope".to_owned());
        assert_eq!(f.service.get_progress(&id), Err(unknown.clone()));
        assert_eq!(f.service.request_cancel(&id), Err(unknown.clone()));
        assert_eq!(f.service.is_bundle_ready(&id), Err(unknown.clone()));
        assert_eq!(f.service.fetch_bundle(&id).await, Err(unknown.clone()));
        assert_eq!(f.service.release_session(&id).await, Err(unknown));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_batches_are_rejected() -> Result<()> {
        let f = fixture()?;
        let doc = write_document(f.dir.path(), "a.pdf", &["a1"])?;
        let id = session("s1")?;
        assert!(matches!(
            f.service.submit_batch(id.clone(), vec![], &eng(), 1).await,
            Err(PipelineError::InvalidBatch(_))
        ));
        assert!(matches!(
            f.service.submit_batch(id.clone(), vec![doc.clone()], &[], 1).await,
            Err(PipelineError::InvalidBatch(_))
        ));
        assert!(matches!(
            f.service.submit_batch(id.clone(), vec![doc], &eng(), 0).await,
            Err(PipelineError::InvalidBatch(_))
        ));
        assert!(matches!(
            f.service.get_progress(&id),
            Err(PipelineError::SessionUnknown(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_sessions_are_rejected() -> Result<()> {
        let f = fixture()?;
        let doc = write_document(f.dir.path(), "a.pdf", &["a1"])?;
        let id = session("s1")?;
        let handle = f
            .service
            .submit_batch(id.clone(), vec![doc.clone()], &eng(), 1)
            .await?;
        assert!(matches!(
            f.service.submit_batch(id.clone(), vec![doc], &eng(), 1).await,
            Err(PipelineError::SessionAlreadyExists(_))
        ));
        handle.wait().await
    }

    #[tokio::test]
    async fn duplicate_file_names_are_disambiguated_in_the_bundle() -> Result<()> {
        let f = fixture()?;
        std::fs::create_dir(f.dir.path().join("other"))?;
        let docs = vec![
            write_document(f.dir.path(), "scan.pdf", &["one"])?,
            write_document(&f.dir.path().join("other"), "scan.pdf", &["two"])?,
        ];
        let id = session("s1")?;
        f.service.submit_batch(id.clone(), docs, &eng(), 2).await?.wait().await?;

        let names = f.service.bundle_entries(&id)?;
        assert_eq!(names, vec!["scan.pdf".to_owned(), "scan (2).pdf".to_owned()]);
        let files = unzip(f.service.fetch_bundle(&id).await?)?;
        assert_eq!(
            files,
            vec![
                ("scan (2).pdf".to_owned(), "TWO".to_owned()),
                ("scan.pdf".to_owned(), "ONE".to_owned()),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn intermediate_files_are_cleaned_up() -> Result<()> {
        let f = fixture()?;
        let docs = vec![
            write_document(f.dir.path(), "ok.pdf", &["a", "b"])?,
            write_document(f.dir.path(), "bad.pdf", &["a", "FAIL"])?,
        ];
        let id = session("s1")?;
        f.service.submit_batch(id.clone(), docs, &eng(), 2).await?.wait().await?;

        let work_dir = f.service.config().processed_dir.join("s1");
        let leftovers = std::fs::read_dir(&work_dir)?.collect::<Result<Vec<_>, _>>()?;
        assert!(leftovers.is_empty(), "left behind: {leftovers:?}");
        Ok(())
    }

    #[tokio::test]
    async fn bundling_failures_are_reported_to_fetch() -> Result<()> {
        let f = fixture()?;
        // A directory where the archive should go can't be opened as a zip.
        std::fs::create_dir_all(f.service.config().processed_dir.join("s1.zip"))?;
        let docs = vec![write_document(f.dir.path(), "a.pdf", &["a1"])?];
        let id = session("s1")?;
        let result = f
            .service
            .submit_batch(id.clone(), docs, &eng(), 1)
            .await?
            .wait()
            .await;
        assert!(result.is_err());
        assert!(matches!(
            f.service.fetch_bundle(&id).await,
            Err(PipelineError::BundleFailed { .. })
        ));
        assert_eq!(
            f.service.get_progress(&id)?[&0].state,
            DocumentState::Succeeded
        );
        Ok(())
    }

    #[tokio::test]
    async fn released_sessions_are_forgotten() -> Result<()> {
        let f = fixture_with(
            FakeEngine::with_delay(Duration::from_millis(10)),
            PipelineConfig::default(),
        )?;
        let docs = vec![write_document(f.dir.path(), "a.pdf", &["a1"])?];
        let id = session("s1")?;
        let handle = f.service.submit_batch(id.clone(), docs, &eng(), 1).await?;
        assert_eq!(
            f.service.release_session(&id).await,
            Err(PipelineError::SessionBusy("s1".to_owned()))
        );
        handle.wait().await?;

        f.service.release_session(&id).await?;
        let processed_dir = &f.service.config().processed_dir;
        assert!(!processed_dir.join("s1").exists());
        assert!(!processed_dir.join("s1.zip").exists());
        assert!(matches!(
            f.service.get_progress(&id),
            Err(PipelineError::SessionUnknown(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn expired_sessions_are_evicted_on_submit() -> Result<()> {
        let f = fixture_with(
            FakeEngine::default(),
            PipelineConfig {
                session_ttl_secs: 0,
                ..PipelineConfig::default()
            },
        )?;
        let first = session("first")?;
        let docs = vec![write_document(f.dir.path(), "a.pdf", &["a1"])?];
        f.service.submit_batch(first.clone(), docs.clone(), &eng(), 1).await?.wait().await?;

        let second = session("second")?;
        let handle = f.service.submit_batch(second.clone(), docs, &eng(), 1).await?;
        assert!(matches!(
            f.service.get_progress(&first),
            Err(PipelineError::SessionUnknown(_))
        ));
        handle.wait().await?;

        let evicted = f.service.evict_expired().await;
        assert_eq!(
            evicted.into_iter().collect::<BTreeSet<_>>(),
            BTreeSet::from([second])
        );
        Ok(())
    }
}
