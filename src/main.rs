use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod bundle;
mod cancel;
mod cmd;
mod config;
mod cpu_limit;
mod engines;
mod errors;
mod pages;
mod pipeline;
mod prelude;
mod progress;
mod queues;
mod service;
mod sessions;
mod ui;

/// OCR batches of PDFs, one page at a time.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Environment Variables:
  - BATCH_OCR_CONFIG (optional): A TOML file with pipeline settings.
  - BATCH_OCR_PROCESSED_DIR (optional): Where to put intermediate files.
  - BATCH_OCR_ENGINE (optional): "ocrmypdf" or "copy".
  - BATCH_OCR_FAILURE_POLICY (optional): "abort-on-first-failure" or
    "skip-and-continue".
  - BATCH_OCR_FORCE_OCR (optional): Re-OCR pages that already have text.
  - BATCH_OCR_SESSION_TTL_SECS (optional): How long to keep finished
    sessions around.
  - RUST_LOG (optional): Logging filter, like "batch_ocr=debug".

  Splitting and reassembly need Poppler's `pdfinfo`, `pdfseparate` and
  `pdfunite`. The default engine needs `ocrmypdf`.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// OCR a batch of PDFs and write the results to a zip file.
    Run(cmd::run::RunOpts),
    /// List the recognition languages installed on this machine.
    Languages,
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Run(opts) => opts.json,
            Cmd::Languages => true,
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bars if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_progress_bars();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Run(run_opts) => {
            cmd::run::cmd_run(ui, run_opts).await?;
        }
        Cmd::Languages => {
            cmd::languages::cmd_languages().await?;
        }
    }
    Ok(())
}
