//! The per-document worker.
//!
//! A worker takes one document through `Splitting`, `Processing` and
//! `Reassembling`, recording progress as it goes. Pages are recognized one at
//! a time, in order, and the session's cancel flag is checked before each
//! one. Every page file lives in a scratch directory that the worker deletes
//! on the way out, whichever way the document finishes.

use std::sync::Arc;

use tempfile::TempDir;

use super::{DocumentJob, FailurePolicy, WorkerSettings};
use crate::{
    async_utils::spawn_blocking_propagating_panics,
    engines::RecognizeInput,
    errors::PipelineError,
    pages::{ProcessedPage, check_complete},
    prelude::*,
    progress::{DocumentId, DocumentState},
    sessions::SessionContext,
};

/// How a document worker finished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DocumentOutcome {
    /// The processed document was written to `output`.
    Succeeded {
        id: DocumentId,
        display_name: String,
        output: PathBuf,
    },
    /// No output was produced.
    Failed { id: DocumentId, error: PipelineError },
    /// The session was cancelled before this document finished.
    Cancelled { id: DocumentId },
}

/// What the stages produced, before we record it.
enum StageResult {
    Finished { skipped: Vec<PipelineError> },
    Cancelled,
}

/// Process one document from start to finish.
///
/// This never returns an error. Failures are contained in the returned
/// [`DocumentOutcome`] and recorded in the session's progress table.
#[instrument(level = "debug", skip_all, fields(session = %ctx.id(), document = %job.display_name))]
pub async fn process_document(
    ctx: Arc<SessionContext>,
    settings: Arc<WorkerSettings>,
    job: DocumentJob,
) -> DocumentOutcome {
    let progress = ctx.progress();

    if ctx.cancel_flag().is_cancelled() {
        debug!("session cancelled before document started");
        progress.finish(job.id, DocumentState::Cancelled, None);
        return DocumentOutcome::Cancelled { id: job.id };
    }

    let scratch = match tempfile::Builder::new()
        .prefix("pages-")
        .tempdir_in(ctx.work_dir())
    {
        Ok(scratch) => scratch,
        Err(err) => {
            let error = PipelineError::DocumentIo {
                document: job.display_name.clone(),
                detail: format!("cannot create scratch directory: {err}"),
            };
            return record_failure(&ctx, job.id, error);
        }
    };

    let result = run_stages(&ctx, &settings, &job, scratch.path()).await;
    remove_scratch(scratch).await;

    match result {
        Ok(StageResult::Finished { skipped }) => {
            let note = (!skipped.is_empty()).then(|| {
                skipped
                    .iter()
                    .map(|err| err.to_string())
                    .collect::<Vec<_>>()
                    .join("; ")
            });
            progress.finish(job.id, DocumentState::Succeeded, note);
            info!("document succeeded");
            DocumentOutcome::Succeeded {
                id: job.id,
                display_name: job.display_name,
                output: job.output,
            }
        }
        Ok(StageResult::Cancelled) => {
            info!("document cancelled");
            progress.finish(job.id, DocumentState::Cancelled, None);
            DocumentOutcome::Cancelled { id: job.id }
        }
        Err(error) => {
            // Never leave a half-written output behind for the bundler.
            match tokio::fs::remove_file(&job.output).await {
                Err(err) if err.kind() != std::io::ErrorKind::NotFound => warn!(
                    path = %job.output.display(),
                    "failed to remove partial output: {}",
                    err
                ),
                _ => {}
            }
            record_failure(&ctx, job.id, error)
        }
    }
}

/// Split, recognize and reassemble.
async fn run_stages(
    ctx: &SessionContext,
    settings: &WorkerSettings,
    job: &DocumentJob,
    scratch_dir: &Path,
) -> Result<StageResult, PipelineError> {
    let progress = ctx.progress();
    let tools = &settings.tools;

    progress.set_state(job.id, DocumentState::Splitting);
    let pages = tools
        .splitter
        .split(&job.source, scratch_dir)
        .await
        .map_err(|err| PipelineError::DocumentCorrupt {
            document: job.display_name.clone(),
            detail: PipelineError::detail(&err),
        })?;
    let total_pages = pages.len();
    debug!(total_pages, "split document");
    progress.update(job.id, 0, total_pages);
    progress.set_state(job.id, DocumentState::Processing);

    let mut processed = Vec::with_capacity(total_pages);
    let mut skipped = vec![];
    for page in pages {
        // Only checked between pages. A page that has started always finishes.
        if ctx.cancel_flag().is_cancelled() {
            debug!(page = page.index, "stopping at page boundary");
            return Ok(StageResult::Cancelled);
        }

        let index = page.index;
        let input = RecognizeInput {
            document: job.display_name.clone(),
            page: page.clone(),
            languages: settings.languages.clone(),
            output_path: scratch_dir.join(format!("processed-{}.pdf", index + 1)),
        };
        match tools.engine.recognize_page(input).await {
            Ok(processed_page) => processed.push(processed_page),
            Err(err) => {
                let error = PipelineError::RecognitionFailed {
                    document: job.display_name.clone(),
                    page: index,
                    detail: PipelineError::detail(&err),
                };
                match settings.failure_policy {
                    FailurePolicy::AbortOnFirstFailure => return Err(error),
                    FailurePolicy::SkipAndContinue => {
                        warn!(page = index, "passing page through unrecognized: {}", error);
                        processed.push(ProcessedPage {
                            index,
                            path: page.path,
                        });
                        skipped.push(error);
                    }
                }
            }
        }
        progress.update(job.id, index + 1, total_pages);
    }

    progress.set_state(job.id, DocumentState::Reassembling);
    check_complete(&job.display_name, &processed, total_pages)?;
    tools
        .reassembler
        .reassemble(&processed[..total_pages], &job.output)
        .await
        .map_err(|err| PipelineError::ReassemblyFailed {
            document: job.display_name.clone(),
            detail: PipelineError::detail(&err),
        })?;
    Ok(StageResult::Finished { skipped })
}

/// Record a failed document.
fn record_failure(ctx: &SessionContext, id: DocumentId, error: PipelineError) -> DocumentOutcome {
    warn!("document failed: {}", error);
    ctx.progress()
        .finish(id, DocumentState::Failed, Some(error.to_string()));
    DocumentOutcome::Failed { id, error }
}

/// Delete a worker's scratch directory without blocking the executor.
async fn remove_scratch(scratch: TempDir) {
    let path = scratch.path().to_owned();
    let result = spawn_blocking_propagating_panics(move || scratch.close()).await;
    if let Err(err) = result {
        warn!(path = %path.display(), "failed to remove scratch directory: {}", err);
    }
}
