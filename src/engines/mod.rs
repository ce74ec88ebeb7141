//! Page recognition engines.
//!
//! The pipeline treats recognition as a black box: hand it one single-page
//! document and a language hint, and it either writes a processed page or
//! fails. Engines never retry. A failed page is reported to the document
//! worker, which applies its [`crate::pipeline::FailurePolicy`].

use std::{fmt, sync::Arc};

use clap::ValueEnum;

use crate::{
    pages::{PageUnit, ProcessedPage},
    prelude::*,
};

pub mod copy;
pub mod ocrmypdf;

/// Input to [`PageEngine::recognize_page`].
#[derive(Clone, Debug)]
pub struct RecognizeInput {
    /// Display name of the document this page came from. Used for logging.
    pub document: String,

    /// The page to recognize.
    pub page: PageUnit,

    /// Languages to recognize.
    pub languages: LanguageHint,

    /// Where the engine should write the processed page.
    pub output_path: PathBuf,
}

/// Interface to a recognition engine.
#[async_trait]
pub trait PageEngine: Send + Sync + 'static {
    /// Recognize a single page, writing the result to `input.output_path`.
    async fn recognize_page(&self, input: RecognizeInput) -> Result<ProcessedPage>;
}

/// One or more language codes, in the form accepted by Tesseract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LanguageHint {
    codes: Vec<String>,
}

impl LanguageHint {
    /// The separator Tesseract and OCRmyPDF use between language codes.
    pub const SEPARATOR: &'static str = "+";

    /// Create a language hint. At least one code is required, and codes may
    /// only contain ASCII letters, digits and underscores (`chi_sim`).
    pub fn new<I, S>(codes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let codes = codes
            .into_iter()
            .map(Into::into)
            .map(|code| code.trim().to_owned())
            .filter(|code| !code.is_empty())
            .collect::<Vec<_>>();
        if codes.is_empty() {
            return Err(anyhow!("please select at least one language"));
        }
        if let Some(bad) = codes
            .iter()
            .find(|code| !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
        {
            return Err(anyhow!("invalid language code {:?}", bad));
        }
        Ok(Self { codes })
    }

    /// The codes joined with [`Self::SEPARATOR`], like `eng+deu`.
    pub fn joined(&self) -> String {
        self.codes.join(Self::SEPARATOR)
    }
}

impl fmt::Display for LanguageHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined())
    }
}

/// The engines we know how to construct.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Run OCRmyPDF on each page.
    #[default]
    #[value(name = "ocrmypdf")]
    #[serde(rename = "ocrmypdf")]
    OcrMyPdf,

    /// Copy pages through unchanged. Useful for dry runs.
    Copy,
}

/// Options shared by all engines.
#[derive(Clone, Debug)]
pub struct EngineOpts {
    /// Don't re-OCR pages that already contain text.
    pub skip_text: bool,
}

/// Construct the engine for `kind`.
pub fn page_engine_for_kind(kind: EngineKind, opts: &EngineOpts) -> Arc<dyn PageEngine> {
    match kind {
        EngineKind::OcrMyPdf => Arc::new(ocrmypdf::OcrMyPdfEngine::new(opts)),
        EngineKind::Copy => Arc::new(copy::CopyEngine::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn languages_are_joined_with_plus() -> Result<()> {
        let hint = LanguageHint::new(["eng", "deu", "chi_sim"])?;
        assert_eq!(hint.joined(), "eng+deu+chi_sim");
        assert_eq!(hint.to_string(), "eng+deu+chi_sim");
        Ok(())
    }

    #[test]
    fn blank_codes_are_dropped() -> Result<()> {
        let hint = LanguageHint::new(["eng", " ", ""])?;
        assert_eq!(hint.joined(), "eng");
        Ok(())
    }

    #[test]
    fn at_least_one_language_is_required() {
        assert!(LanguageHint::new(Vec::<String>::new()).is_err());
        assert!(LanguageHint::new([""]).is_err());
    }

    #[test]
    fn option_like_codes_are_rejected() {
        assert!(LanguageHint::new(["--tesseract-config"]).is_err());
        assert!(LanguageHint::new(["eng+deu"]).is_err());
    }

    #[test]
    fn engine_kinds_use_stable_names() -> Result<()> {
        #[derive(Deserialize)]
        struct Wrapper {
            engine: EngineKind,
        }
        let wrapper: Wrapper = toml::from_str("engine = \"ocrmypdf\"")?;
        assert_eq!(wrapper.engine, EngineKind::OcrMyPdf);
        assert_eq!(
            EngineKind::from_str("copy", false).map_err(|e| anyhow!(e))?,
            EngineKind::Copy
        );
        Ok(())
    }
}
