//! Pass-through engine for dry runs and testing.
//!
//! Copies each page unchanged. Handy for checking that splitting, progress
//! reporting and bundling work on a machine without OCRmyPDF installed.

use super::{PageEngine, RecognizeInput};
use crate::{pages::ProcessedPage, prelude::*};

/// Pass-through engine.
#[derive(Debug, Default)]
pub struct CopyEngine;

impl CopyEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PageEngine for CopyEngine {
    #[instrument(level = "trace", skip_all, fields(document = %input.document, page = input.page.index))]
    async fn recognize_page(&self, input: RecognizeInput) -> Result<ProcessedPage> {
        tokio::fs::copy(&input.page.path, &input.output_path)
            .await
            .with_context(|| {
                format!(
                    "failed to copy {:?} to {:?}",
                    input.page.path.display(),
                    input.output_path.display()
                )
            })?;
        Ok(ProcessedPage {
            index: input.page.index,
            path: input.output_path,
        })
    }
}
