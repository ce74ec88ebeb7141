//! OCR engine wrapping the `ocrmypdf` CLI tool.

use std::ffi::OsString;

use tokio::process::Command;

use super::{EngineOpts, PageEngine, RecognizeInput};
use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore,
    pages::ProcessedPage, prelude::*,
};

/// Runs `ocrmypdf` on one single-page PDF at a time, adding a text layer.
#[derive(Debug)]
#[non_exhaustive]
pub struct OcrMyPdfEngine {
    skip_text: bool,
}

impl OcrMyPdfEngine {
    /// Create a new `ocrmypdf` engine.
    pub fn new(opts: &EngineOpts) -> Self {
        Self {
            skip_text: opts.skip_text,
        }
    }

    /// Build the argument list for one page.
    fn command_args(&self, input: &RecognizeInput) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![];
        if self.skip_text {
            args.push("--skip-text".into());
        }
        // We already run one process per CPU, so keep each one single-threaded.
        for arg in ["--jobs", "1", "--quiet", "-l"] {
            args.push(arg.into());
        }
        args.push(input.languages.joined().into());
        args.push(input.page.path.clone().into());
        args.push(input.output_path.clone().into());
        args
    }
}

#[async_trait]
impl PageEngine for OcrMyPdfEngine {
    #[instrument(level = "debug", skip_all, fields(document = %input.document, page = input.page.index))]
    async fn recognize_page(&self, input: RecognizeInput) -> Result<ProcessedPage> {
        let args = self.command_args(&input);
        let output = with_cpu_semaphore(|| async {
            Command::new("ocrmypdf")
                .args(&args)
                .output()
                .await
                .context("cannot run ocrmypdf")
        })
        .await?;
        check_for_command_failure("ocrmypdf", &output, None)?;

        if !input.output_path.is_file() {
            return Err(anyhow!(
                "ocrmypdf exited successfully but did not write {:?}",
                input.output_path.display()
            ));
        }
        Ok(ProcessedPage {
            index: input.page.index,
            path: input.output_path,
        })
    }
}
