use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;

use crate::error::PipelineError;
use crate::retry::RetryPolicy;

pub const DEFAULT_MODEL: &str = "gemini-2.5-pro-preview-03-25";
pub const DEFAULT_API_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const API_KEY_ENV: &str = "GOOGLE_API_KEY";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub google_api_key: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub model: String,
    pub num_retries: u32,
    pub max_backoff_seconds: u64,
    /// Characters of the previous unit carried as context. 0 disables it.
    pub previous_content_limit: usize,
    pub target_title: Option<String>,
    pub source_language: String,
    pub target_language: String,

    pub api_base_url: String,
    pub output_dir: PathBuf,
    pub use_streaming: bool,
    pub request_timeout_seconds: u64,
    pub compress_threshold_mb: u64,

    pub log_level: String,
    pub log_file: bool,
    pub log_max_bytes: u64,
    pub log_retention_days: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            google_api_key: None,
            title: None,
            author: None,
            model: DEFAULT_MODEL.to_owned(),
            num_retries: 3,
            max_backoff_seconds: 30,
            previous_content_limit: 0,
            target_title: None,
            source_language: "English".to_owned(),
            target_language: "Chinese".to_owned(),
            api_base_url: DEFAULT_API_BASE_URL.to_owned(),
            output_dir: PathBuf::from("output"),
            use_streaming: true,
            request_timeout_seconds: 60 * 60,
            compress_threshold_mb: 45,
            log_level: "info".to_owned(),
            log_file: true,
            log_max_bytes: 10 * 1024 * 1024,
            log_retention_days: 7,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("parse config: {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        // An empty file deserializes to `null`, which should mean "all defaults".
        let config: Option<Config> = serde_yaml::from_str(raw).context("parse yaml")?;
        let config = config.unwrap_or_default();
        if config.num_retries == 0 {
            anyhow::bail!("num_retries must be >= 1");
        }
        Ok(config)
    }

    pub fn with_languages(mut self, source: Option<String>, target: Option<String>) -> Self {
        if let Some(source) = source {
            self.source_language = source;
        }
        if let Some(target) = target {
            self.target_language = target;
        }
        self
    }

    pub fn api_key(&self) -> Result<String, PipelineError> {
        if let Some(key) = self.google_api_key.as_deref().map(str::trim)
            && !key.is_empty()
        {
            return Ok(key.to_owned());
        }
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_owned()),
            _ => Err(PipelineError::MissingInput(format!(
                "google_api_key is not set in the config and {API_KEY_ENV} is empty"
            ))),
        }
    }

    /// The configured title, or the input file stem when none is set.
    /// Callers warn about the fallback once logging is up.
    pub fn book_title(&self, input: &Path) -> String {
        if let Some(title) = self.title.as_deref().map(str::trim)
            && !title.is_empty()
        {
            return title.to_owned();
        }
        input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "book".to_owned())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.num_retries,
            Duration::from_secs(self.max_backoff_seconds),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}
