//! Council configuration.
//!
//! The council model list and the chairman are read once per job through a
//! [`ConfigProvider`] and handed to the pipeline as a plain value. Nothing in
//! the pipeline reloads configuration mid-run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Council composition and per-call limits for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouncilConfig {
    /// Models queried in stage 1 and asked to rank in stage 2, in order.
    pub council_models: Vec<String>,
    /// Model used for stage 3 synthesis.
    pub chairman_model: String,
    /// Independent timeout for each model call (default: 120).
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Sampling temperature for every stage; provider default when unset.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Names a conversation after its first question. Empty disables titles.
    #[serde(default = "default_title_model")]
    pub title_model: String,
}

fn default_call_timeout_secs() -> u64 {
    120
}

fn default_title_model() -> String {
    "google/gemini-2.5-flash".into()
}

impl Default for CouncilConfig {
    fn default() -> Self {
        Self {
            council_models: vec![
                "openai/gpt-5.1".into(),
                "google/gemini-3-pro-preview".into(),
                "anthropic/claude-sonnet-4.5".into(),
                "x-ai/grok-4".into(),
            ],
            chairman_model: "google/gemini-3-pro-preview".into(),
            call_timeout_secs: default_call_timeout_secs(),
            temperature: None,
            title_model: default_title_model(),
        }
    }
}

impl CouncilConfig {
    pub fn new(council_models: Vec<String>, chairman_model: impl Into<String>) -> Self {
        Self {
            council_models,
            chairman_model: chairman_model.into(),
            ..Self::default()
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.council_models.is_empty() {
            return Err(ConfigError::Invalid(
                "council_models must not be empty".into(),
            ));
        }
        let mut seen = HashSet::new();
        for model in &self.council_models {
            if model.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "council_models must not contain empty ids".into(),
                ));
            }
            if !seen.insert(model.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate council model: {model}"
                )));
            }
        }
        if self.chairman_model.trim().is_empty() {
            return Err(ConfigError::Invalid("chairman_model must be set".into()));
        }
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "call_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: CouncilConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }
}

/// Source of the council configuration, consulted once per job.
pub trait ConfigProvider: Send + Sync {
    fn load(&self) -> Result<CouncilConfig, ConfigError>;
}

/// Fixed configuration value.
#[derive(Debug, Clone)]
pub struct StaticConfigProvider(pub CouncilConfig);

impl ConfigProvider for StaticConfigProvider {
    fn load(&self) -> Result<CouncilConfig, ConfigError> {
        self.0.validate()?;
        Ok(self.0.clone())
    }
}

/// JSON file re-read on each `load`, so edits apply to the next job.
#[derive(Debug, Clone)]
pub struct JsonFileConfigProvider {
    path: PathBuf,
}

impl JsonFileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigProvider for JsonFileConfigProvider {
    fn load(&self) -> Result<CouncilConfig, ConfigError> {
        CouncilConfig::from_json_file(&self.path)
    }
}

/// Process-level knobs, read from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Jobs executed concurrently by the local queue.
    pub workers: usize,
    /// Simultaneous outbound model calls.
    pub max_concurrent_calls: usize,
    /// Wait before asking the provider for billed costs.
    pub reconcile_grace: Duration,
    /// SQLite database path.
    pub db_path: PathBuf,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            max_concurrent_calls: 16,
            reconcile_grace: Duration::from_secs(3),
            db_path: PathBuf::from(".council.sqlite"),
        }
    }
}

impl RuntimeSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workers: env_parse("COUNCIL_WORKERS").unwrap_or(defaults.workers),
            max_concurrent_calls: env_parse("COUNCIL_MAX_CONCURRENT_CALLS")
                .unwrap_or(defaults.max_concurrent_calls),
            reconcile_grace: env_parse("COUNCIL_RECONCILE_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconcile_grace),
            db_path: std::env::var("COUNCIL_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = CouncilConfig::default();
        config.validate().unwrap();
        assert_eq!(config.council_models.len(), 4);
        assert_eq!(config.call_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn rejects_duplicate_council_models() {
        let config = CouncilConfig::new(vec!["a/x".into(), "a/x".into()], "a/x");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_empty_council_and_chairman() {
        assert!(CouncilConfig::new(vec![], "a/x").validate().is_err());
        assert!(CouncilConfig::new(vec!["a/x".into()], " ").validate().is_err());
    }

    #[test]
    fn json_file_provider_reads_on_each_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("council.json");
        std::fs::write(
            &path,
            r#"{"council_models":["a/one","b/two"],"chairman_model":"a/one"}"#,
        )
        .unwrap();

        let provider = JsonFileConfigProvider::new(&path);
        let first = provider.load().unwrap();
        assert_eq!(first.council_models, vec!["a/one", "b/two"]);
        assert_eq!(first.call_timeout_secs, 120);
        assert_eq!(first.title_model, "google/gemini-2.5-flash");

        std::fs::write(
            &path,
            r#"{"council_models":["c/three"],"chairman_model":"c/three","call_timeout_secs":5}"#,
        )
        .unwrap();
        let second = provider.load().unwrap();
        assert_eq!(second.council_models, vec!["c/three"]);
        assert_eq!(second.call_timeout(), Duration::from_secs(5));
    }
}
