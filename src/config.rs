//! Pipeline configuration.
//!
//! Settings come from three places, in increasing order of priority: built-in
//! defaults, an optional TOML file, and command-line flags (or their
//! `BATCH_OCR_*` environment variables).

use std::time::Duration;

use clap::Args;

use crate::{
    engines::{EngineKind, EngineOpts, LanguageHint},
    pipeline::FailurePolicy,
    prelude::*,
};

/// Settings for an [`crate::service::OcrService`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Where session work directories and bundles are written.
    pub processed_dir: PathBuf,

    /// Default number of documents to process at once.
    pub concurrency_limit: usize,

    /// Default recognition languages.
    pub languages: Vec<String>,

    /// Which engine to run on each page.
    pub engine: EngineKind,

    /// What to do when a page can't be recognized.
    pub failure_policy: FailurePolicy,

    /// How long to keep a finished session around before it may be evicted.
    pub session_ttl_secs: u64,

    /// Leave pages that already contain text alone.
    pub skip_text: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            processed_dir: std::env::temp_dir().join("batch-ocr"),
            concurrency_limit: 2,
            languages: vec!["eng".to_owned()],
            engine: EngineKind::default(),
            failure_policy: FailurePolicy::default(),
            session_ttl_secs: 3600,
            skip_text: true,
        }
    }
}

impl PipelineConfig {
    /// Read a configuration file. Missing keys get their default values.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file at path: {:?}", path))?;
        let config: Self = toml::from_str(&data).with_context(|| {
            format!("Failed to parse TOML from file at path: {:?}", path)
        })?;
        Ok(config)
    }

    /// Check that these settings make sense.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(anyhow!("concurrency_limit must be at least 1"));
        }
        LanguageHint::new(self.languages.iter().cloned())
            .context("invalid default languages")?;
        Ok(())
    }

    /// The default language hint.
    pub fn language_hint(&self) -> Result<LanguageHint> {
        LanguageHint::new(self.languages.iter().cloned())
    }

    /// Options to pass to the engine.
    pub fn engine_opts(&self) -> EngineOpts {
        EngineOpts {
            skip_text: self.skip_text,
        }
    }

    /// How long finished sessions are kept.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

/// Command-line options for loading a [`PipelineConfig`].
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigOpts {
    /// A TOML file with pipeline settings.
    #[clap(long = "config", env = "BATCH_OCR_CONFIG")]
    pub config_path: Option<PathBuf>,

    /// Directory for intermediate files and bundles.
    #[clap(long, env = "BATCH_OCR_PROCESSED_DIR")]
    pub processed_dir: Option<PathBuf>,

    /// Recognition engine.
    #[clap(long, value_enum, env = "BATCH_OCR_ENGINE")]
    pub engine: Option<EngineKind>,

    /// What to do when a page can't be recognized.
    #[clap(long, value_enum, env = "BATCH_OCR_FAILURE_POLICY")]
    pub failure_policy: Option<FailurePolicy>,

    /// OCR every page, even pages that already contain text.
    #[clap(long, env = "BATCH_OCR_FORCE_OCR")]
    pub force_ocr: bool,

    /// Seconds to keep finished sessions before evicting them.
    #[clap(long, env = "BATCH_OCR_SESSION_TTL_SECS")]
    pub session_ttl_secs: Option<u64>,
}

impl ConfigOpts {
    /// Load the config file, if any, and apply our overrides.
    pub async fn load(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config_path {
            Some(path) => PipelineConfig::from_path(path).await?,
            None => PipelineConfig::default(),
        };
        self.apply_to(&mut config);
        config.validate()?;
        debug!(?config, "loaded pipeline config");
        Ok(config)
    }

    /// Apply command-line overrides to `config`.
    fn apply_to(&self, config: &mut PipelineConfig) {
        if let Some(processed_dir) = &self.processed_dir {
            config.processed_dir = processed_dir.clone();
        }
        if let Some(engine) = self.engine {
            config.engine = engine;
        }
        if let Some(failure_policy) = self.failure_policy {
            config.failure_policy = failure_policy;
        }
        if self.force_ocr {
            config.skip_text = false;
        }
        if let Some(session_ttl_secs) = self.session_ttl_secs {
            config.session_ttl_secs = session_ttl_secs;
        }
    }
}
