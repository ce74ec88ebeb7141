//! The `run` subcommand.

use std::{collections::BTreeMap, time::Duration};

use clap::Args;
use indicatif::ProgressBar;

use crate::{
    config::ConfigOpts,
    errors::PipelineError,
    prelude::*,
    progress::{DocumentId, DocumentState, ProgressSnapshot},
    service::OcrService,
    sessions::SessionId,
    ui::{Ui, update_document_bar},
};

/// Options for the `run` subcommand.
#[derive(Debug, Args)]
pub struct RunOpts {
    /// PDF documents to process.
    #[clap(required = true)]
    pub input_paths: Vec<PathBuf>,

    /// Tesseract language code. May be repeated: `-l eng -l deu`.
    #[clap(short = 'l', long = "language")]
    pub languages: Vec<String>,

    /// Max number of documents to process at once.
    #[clap(short = 'j', long = "jobs")]
    pub job_count: Option<usize>,

    /// Where to write the zip file of processed documents.
    #[clap(short = 'o', long = "output", default_value = "processed_pdfs.zip")]
    pub output_path: PathBuf,

    /// Print a JSON report of every document to standard output.
    #[clap(long)]
    pub json: bool,

    /// Session ID to use. Defaults to a random ID.
    #[clap(long)]
    pub session: Option<SessionId>,

    #[clap(flatten)]
    pub config: ConfigOpts,
}

/// What we print with `--json`.
#[derive(Debug, Serialize)]
struct RunReport<'a> {
    session: &'a SessionId,
    /// Did every document have all of its pages recognized?
    complete: bool,
    /// The bundle we wrote, if any.
    bundle: Option<&'a Path>,
    documents: &'a ProgressSnapshot,
}

/// How often to redraw progress bars.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Run the `run` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(ui: Ui, opts: &RunOpts) -> Result<()> {
    let service = OcrService::from_config(opts.config.load().await?);
    let config = service.config();
    let languages = if opts.languages.is_empty() {
        config.languages.clone()
    } else {
        opts.languages.clone()
    };
    let job_count = opts.job_count.unwrap_or(config.concurrency_limit);
    for path in &opts.input_paths {
        if !path.is_file() {
            return Err(anyhow!("cannot find input file {:?}", path.display()));
        }
    }

    let session = opts.session.clone().unwrap_or_else(SessionId::generate);
    let handle = service
        .submit_batch(
            session.clone(),
            opts.input_paths.clone(),
            &languages,
            job_count,
        )
        .await?;

    let bars = service
        .get_progress(&session)?
        .into_iter()
        .map(|(id, document)| (id, ui.new_document_bar(&document.display_name)))
        .collect::<BTreeMap<_, _>>();

    // Redraw until the batch finishes, cancelling on the first Ctrl-C.
    let wait = handle.wait();
    tokio::pin!(wait);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut cancel_requested = false;
    let batch_result = loop {
        tokio::select! {
            result = &mut wait => break result,
            _ = ticker.tick() => render(&service, &session, &bars)?,
            signal = &mut ctrl_c, if !cancel_requested => {
                signal.context("cannot listen for Ctrl-C")?;
                cancel_requested = true;
                ui.display_message("🛑", "Cancelling after the current pages finish");
                service.request_cancel(&session)?;
            }
        }
    };
    render(&service, &session, &bars)?;
    let snapshot = deliver_and_release(&ui, opts, &service, &session).await?;
    batch_result?;
    summarize(&snapshot)
}

/// Write the bundle and report, then release the session whether or not
/// that worked. Returns the final progress snapshot.
async fn deliver_and_release(
    ui: &Ui,
    opts: &RunOpts,
    service: &OcrService,
    session: &SessionId,
) -> Result<ProgressSnapshot> {
    let delivered = deliver(ui, opts, service, session).await;
    let released = service.release_session(session).await;
    let snapshot = delivered?;
    released?;
    Ok(snapshot)
}

/// Write the bundle to `--output`, and print the `--json` report if asked.
async fn deliver(
    ui: &Ui,
    opts: &RunOpts,
    service: &OcrService,
    session: &SessionId,
) -> Result<ProgressSnapshot> {
    let snapshot = service.get_progress(session)?;

    let bundle_written = match service.fetch_bundle(session).await {
        Ok(bytes) => {
            tokio::fs::write(&opts.output_path, bytes)
                .await
                .with_context(|| {
                    format!("cannot write {:?}", opts.output_path.display())
                })?;
            let count = service.bundle_entries(session)?.len();
            ui.display_message(
                "📦",
                &format!(
                    "Wrote {} documents to {}",
                    count,
                    opts.output_path.display()
                ),
            );
            true
        }
        Err(PipelineError::BundleNotFound(_)) => {
            ui.display_message("⚠️", "No documents succeeded, so no bundle was written");
            false
        }
        Err(err) => return Err(err.into()),
    };

    if opts.json {
        let report = RunReport {
            session,
            complete: service.is_complete(session)?,
            bundle: bundle_written.then_some(opts.output_path.as_path()),
            documents: &snapshot,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(snapshot)
}

/// Update every bar from the latest snapshot.
fn render(
    service: &OcrService,
    session: &SessionId,
    bars: &BTreeMap<DocumentId, ProgressBar>,
) -> Result<()> {
    for (id, document) in service.get_progress(session)? {
        if let Some(pb) = bars.get(&id) {
            update_document_bar(pb, &document);
        }
    }
    Ok(())
}

/// Turn failed or cancelled documents into an error exit.
fn summarize(snapshot: &ProgressSnapshot) -> Result<()> {
    let count = |state: DocumentState| {
        snapshot
            .values()
            .filter(|document| document.state == state)
            .count()
    };
    let failed = count(DocumentState::Failed);
    let cancelled = count(DocumentState::Cancelled);
    if failed > 0 || cancelled > 0 {
        return Err(anyhow!(
            "{} of {} documents failed and {} were cancelled",
            failed,
            snapshot.len(),
            cancelled
        ));
    }
    Ok(())
}
