//! The session coordinator.
//!
//! [`run_session`] pushes every document in a batch through a bounded
//! [`WorkQueue`], waits for all of the document workers to finish, and then
//! bundles whatever succeeded. It runs in its own task, independently of
//! whoever submitted the batch.

use std::sync::Arc;

use clap::ValueEnum;
use futures::{FutureExt as _, StreamExt as _, stream};

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    bundle::{BundleEntry, write_bundle},
    engines::{LanguageHint, PageEngine},
    errors::PipelineError,
    pages::{PageSplitter, Reassembler},
    prelude::*,
    progress::DocumentId,
    queues::work::{WorkFn, WorkQueue},
    sessions::{BundleState, SessionContext, SessionPhase},
};

use self::document::{DocumentOutcome, process_document};

pub mod document;
#[cfg(test)]
pub mod testing;

/// What to do when the engine fails on a page.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop processing the document. Later pages are never submitted, and no
    /// output is produced.
    #[default]
    AbortOnFirstFailure,

    /// Put the unrecognized page into the output as-is, and keep going.
    SkipAndContinue,
}

/// The pluggable parts of the pipeline.
#[derive(Clone)]
pub struct PipelineTools {
    pub splitter: Arc<dyn PageSplitter>,
    pub engine: Arc<dyn PageEngine>,
    pub reassembler: Arc<dyn Reassembler>,
}

/// One document to process.
#[derive(Clone, Debug)]
pub struct DocumentJob {
    /// Position in the submitted batch.
    pub id: DocumentId,

    /// The original file name, used in progress reports and in the bundle.
    pub display_name: String,

    /// The submitted document.
    pub source: PathBuf,

    /// Where to write the processed document.
    pub output: PathBuf,
}

/// Settings shared by every worker in a session.
pub struct WorkerSettings {
    pub tools: PipelineTools,
    pub languages: LanguageHint,
    pub failure_policy: FailurePolicy,
}

/// Process every job in a session, at most `concurrency_limit` documents at a
/// time, then bundle the results.
///
/// Document failures are recorded in the progress table and don't make this
/// fail. An error here means bundling failed. That failure is also recorded
/// on the session, so callers polling for the bundle will see it.
#[instrument(level = "debug", skip_all, fields(session = %ctx.id(), documents = jobs.len()))]
pub async fn run_session(
    ctx: Arc<SessionContext>,
    jobs: Vec<DocumentJob>,
    settings: Arc<WorkerSettings>,
    concurrency_limit: usize,
) -> Result<()> {
    ctx.advance_phase(SessionPhase::Running);
    let outcomes = run_workers(&ctx, jobs, settings, concurrency_limit).await;

    // Anything without a terminal state by now lost its worker.
    ctx.progress()
        .fail_unfinished("document worker stopped unexpectedly");
    ctx.advance_phase(SessionPhase::AllWorkersDone);

    let mut succeeded = vec![];
    let (mut failed, mut cancelled) = (0, 0);
    for outcome in outcomes {
        match outcome {
            DocumentOutcome::Succeeded {
                id,
                display_name,
                output,
            } => succeeded.push((id, BundleEntry {
                name: display_name,
                path: output,
            })),
            DocumentOutcome::Failed { id, error } => {
                debug!(document_id = id, %error, "not bundling failed document");
                failed += 1;
            }
            DocumentOutcome::Cancelled { id } => {
                debug!(document_id = id, "not bundling cancelled document");
                cancelled += 1;
            }
        }
    }
    info!(succeeded = succeeded.len(), failed, cancelled, "all document workers finished");
    succeeded.sort_by_key(|(id, _)| *id);
    let entries = succeeded
        .into_iter()
        .map(|(_, entry)| entry)
        .collect::<Vec<_>>();

    let archive_path = ctx.bundle_path().to_owned();
    let result = {
        let archive_path = archive_path.clone();
        spawn_blocking_propagating_panics(move || write_bundle(&archive_path, &entries))
            .await
    };
    match result {
        Ok(Some(names)) => {
            ctx.finish_bundling(BundleState::Ready {
                path: archive_path,
                entries: names,
            });
            Ok(())
        }
        Ok(None) => {
            info!("no documents succeeded; nothing to bundle");
            ctx.finish_bundling(BundleState::Empty);
            Ok(())
        }
        Err(err) => {
            let detail = PipelineError::detail(&err);
            error!("bundling failed: {}", detail);
            ctx.finish_bundling(BundleState::Failed(detail.clone()));
            Err(PipelineError::BundleFailed {
                session: ctx.id().to_string(),
                detail,
            }
            .into())
        }
    }
}

/// Run every job through a bounded work queue, returning the outcomes of the
/// workers that reported back.
async fn run_workers(
    ctx: &Arc<SessionContext>,
    jobs: Vec<DocumentJob>,
    settings: Arc<WorkerSettings>,
    concurrency_limit: usize,
) -> Vec<DocumentOutcome> {
    let work_fn: WorkFn<DocumentJob, DocumentOutcome> = {
        let ctx = ctx.clone();
        Arc::new(move |job| {
            process_document(ctx.clone(), settings.clone(), job)
                .map(Ok)
                .boxed()
        })
    };
    let (queue, worker) = match WorkQueue::new(concurrency_limit, work_fn) {
        Ok(pair) => pair,
        Err(err) => {
            error!("cannot start work queue: {:#}", err);
            return vec![];
        }
    };
    let handle = queue.handle();
    drop(queue);

    let results = handle
        .process_stream(stream::iter(jobs).boxed())
        .buffer_unordered(concurrency_limit)
        .collect::<Vec<_>>()
        .await;
    drop(handle);
    if let Err(err) = worker.join().await {
        error!("work queue failed: {:#}", err);
    }

    results
        .into_iter()
        .filter_map(|result| match result {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                error!("lost a document worker: {:#}", err);
                None
            }
        })
        .collect()
}
