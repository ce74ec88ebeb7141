//! PDF splitting and reassembly using Poppler's command-line tools.
//!
//! We shell out to `pdfinfo`, `pdfseparate` and `pdfunite` rather than
//! parsing PDFs ourselves. Poppler copes with a remarkable range of broken
//! files, and when it can't, it tells us so on standard error.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use tokio::process::Command;

use super::{PageSplitter, PageUnit, ProcessedPage, Reassembler};
use crate::{
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics},
    cpu_limit::with_cpu_semaphore,
    prelude::*,
};

/// The only MIME type we know how to split.
const PDF_MIME_TYPE: &str = "application/pdf";

/// Matches lines Poppler uses to report errors.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Errors Poppler recovers from by itself.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line contain an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Splits PDFs with `pdfseparate`.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct PopplerSplitter {}

impl PopplerSplitter {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl PageSplitter for PopplerSplitter {
    #[instrument(level = "debug", skip_all, fields(path = %source.display()))]
    async fn split(&self, source: &Path, scratch_dir: &Path) -> Result<Vec<PageUnit>> {
        let mime_type = {
            let source = source.to_owned();
            spawn_blocking_propagating_panics(move || get_mime_type(&source)).await?
        };
        if mime_type != PDF_MIME_TYPE {
            return Err(anyhow!(
                "unsupported MIME type {} for {:?} (only PDF is supported)",
                mime_type,
                source.display()
            ));
        }

        let total_pages = get_pdf_page_count(source).await?;
        if total_pages == 0 {
            return Err(anyhow!("{:?} contains no pages", source.display()));
        }

        // pdfseparate replaces `%d` with the 1-based page number.
        let pattern = scratch_dir.join("page-%d.pdf");
        let output = with_cpu_semaphore(|| async {
            Command::new("pdfseparate")
                .arg("-f")
                .arg("1")
                .arg("-l")
                .arg(total_pages.to_string())
                .arg(source)
                .arg(&pattern)
                .output()
                .await
                .with_context(|| {
                    format!("failed to run pdfseparate on {:?}", source.display())
                })
        })
        .await?;
        check_for_command_failure("pdfseparate", &output, Some(&is_error_line))?;

        // Build the list from the page numbers we asked for, instead of
        // sorting directory entries, so that "page-10" follows "page-9".
        (0..total_pages)
            .map(|index| {
                let path = scratch_dir.join(format!("page-{}.pdf", index + 1));
                if path.is_file() {
                    Ok(PageUnit { index, path })
                } else {
                    Err(anyhow!(
                        "pdfseparate did not produce page {} of {:?}",
                        index + 1,
                        source.display()
                    ))
                }
            })
            .collect()
    }
}

/// Concatenates single-page PDFs with `pdfunite`.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct PopplerReassembler {}

impl PopplerReassembler {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl Reassembler for PopplerReassembler {
    #[instrument(level = "debug", skip_all, fields(output = %output.display(), pages = pages.len()))]
    async fn reassemble(&self, pages: &[ProcessedPage], output: &Path) -> Result<()> {
        match pages {
            [] => Err(anyhow!("cannot reassemble a document with no pages")),
            // pdfunite wants at least two inputs, so just copy a lone page.
            [page] => {
                tokio::fs::copy(&page.path, output).await.with_context(|| {
                    format!(
                        "failed to copy {:?} to {:?}",
                        page.path.display(),
                        output.display()
                    )
                })?;
                Ok(())
            }
            _ => {
                let command_output = with_cpu_semaphore(|| async {
                    Command::new("pdfunite")
                        .args(pages.iter().map(|page| &page.path))
                        .arg(output)
                        .output()
                        .await
                        .context("failed to run pdfunite")
                })
                .await?;
                check_for_command_failure("pdfunite", &command_output, Some(&is_error_line))
            }
        }
    }
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    let properties = parse_pdfinfo(&output);
    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    page_count_str.parse::<usize>().with_context(|| {
        format!(
            "failed to parse page count for {:?} from pdfinfo output",
            path.display()
        )
    })
}

/// Parse `Key: value` lines from `pdfinfo`.
fn parse_pdfinfo(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_owned(), value.trim().to_owned()))
        })
        .collect()
}

/// Get the MIME type of a file from its contents. This reads the file, so
/// async callers should run it on the blocking pool.
pub fn get_mime_type(path: &Path) -> Result<String> {
    Ok(infer::get_from_path(path)
        .with_context(|| format!("failed to get MIME type for {:?}", path.display()))?
        .ok_or_else(|| anyhow!("unknown MIME type for {:?}", path.display()))?
        .mime_type()
        .to_string())
}
