//! Fake pipeline tools for tests.
//!
//! These work on plain-text "documents" where pages are separated by form
//! feeds (`\x0C`), so we can test orchestration without Poppler or OCRmyPDF.
//! The fake engine "recognizes" a page by upper-casing it.

use std::{
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use super::PipelineTools;
use crate::{
    engines::{PageEngine, RecognizeInput},
    pages::{PageSplitter, PageUnit, ProcessedPage, Reassembler},
    prelude::*,
};

/// Page separator for fake documents.
pub const PAGE_BREAK: char = '\x0C';

/// Splits on [`PAGE_BREAK`]. Documents starting with `%CORRUPT` fail.
#[derive(Debug, Default)]
pub struct FakeSplitter;

#[async_trait]
impl PageSplitter for FakeSplitter {
    async fn split(&self, source: &Path, scratch_dir: &Path) -> Result<Vec<PageUnit>> {
        let text = tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("cannot read {:?}", source.display()))?;
        if text.starts_with("%CORRUPT") {
            return Err(anyhow!("cannot determine page count"));
        }
        let mut pages = vec![];
        for (index, page) in text.split(PAGE_BREAK).enumerate() {
            let path = scratch_dir.join(format!("page-{}.txt", index + 1));
            tokio::fs::write(&path, page).await?;
            pages.push(PageUnit { index, path });
        }
        Ok(pages)
    }
}

/// Callback run after each page is recognized, with the document name and
/// page index.
pub type PageCallback = Box<dyn Fn(&str, usize) + Send + Sync>;

/// Upper-cases each page. Pages containing `FAIL` fail.
#[derive(Default)]
pub struct FakeEngine {
    delay: Duration,
    calls: Mutex<Vec<(String, usize)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    on_page_done: OnceLock<PageCallback>,
}

impl FakeEngine {
    /// Sleep for `delay` while "recognizing" each page.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Set a callback to run after each page. May only be set once.
    pub fn on_page_done(&self, callback: impl Fn(&str, usize) + Send + Sync + 'static) {
        if self.on_page_done.set(Box::new(callback)).is_err() {
            panic!("on_page_done already set");
        }
    }

    /// Every page we were asked to recognize, in order.
    pub fn calls(&self) -> Vec<(String, usize)> {
        self.calls.lock().expect("lock poisoned").clone()
    }

    /// Pages submitted for one document.
    pub fn pages_for(&self, document: &str) -> Vec<usize> {
        self.calls()
            .into_iter()
            .filter(|(name, _)| name == document)
            .map(|(_, page)| page)
            .collect()
    }

    /// The most pages we were ever recognizing at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageEngine for FakeEngine {
    async fn recognize_page(&self, input: RecognizeInput) -> Result<ProcessedPage> {
        self.calls
            .lock()
            .expect("lock poisoned")
            .push((input.document.clone(), input.page.index));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = async {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let text = tokio::fs::read_to_string(&input.page.path).await?;
            if text.contains("FAIL") {
                return Err(anyhow!("engine rejected page"));
            }
            tokio::fs::write(&input.output_path, text.to_uppercase()).await?;
            Ok(ProcessedPage {
                index: input.page.index,
                path: input.output_path.clone(),
            })
        }
        .await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if result.is_ok() {
            if let Some(callback) = self.on_page_done.get() {
                callback(&input.document, input.page.index);
            }
        }
        result
    }
}

/// Joins pages with [`PAGE_BREAK`].
#[derive(Debug, Default)]
pub struct FakeReassembler;

#[async_trait]
impl Reassembler for FakeReassembler {
    async fn reassemble(&self, pages: &[ProcessedPage], output: &Path) -> Result<()> {
        let mut texts = vec![];
        for page in pages {
            texts.push(tokio::fs::read_to_string(&page.path).await?);
        }
        tokio::fs::write(output, texts.join(&PAGE_BREAK.to_string())).await?;
        Ok(())
    }
}

/// Build [`PipelineTools`] around `engine`.
pub fn fake_tools(engine: Arc<FakeEngine>) -> PipelineTools {
    PipelineTools {
        splitter: Arc::new(FakeSplitter),
        engine,
        reassembler: Arc::new(FakeReassembler),
    }
}

/// Write a fake document with the given pages.
pub fn write_document(dir: &Path, name: &str, pages: &[&str]) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, pages.join(&PAGE_BREAK.to_string()))?;
    Ok(path)
}
