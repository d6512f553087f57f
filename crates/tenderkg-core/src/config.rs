use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Retry budget for one chunk merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

/// Run-wide settings. Built once at start-up; CLI flags override env, env
/// overrides these defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// SQLite graph database
    pub database: PathBuf,
    /// Schema document; the built-in tender schema when unset
    pub schema: Option<PathBuf>,
    /// Chunks merged concurrently
    pub concurrency: usize,
    pub retry: RetryConfig,
    /// Upper bound on any single store call
    pub store_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            schema: None,
            concurrency: 4,
            retry: RetryConfig::default(),
            store_timeout_ms: 10_000,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`Self::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(db) = get("TENDERKG_DB") {
            config.database = PathBuf::from(db);
        }
        if let Some(schema) = get("TENDERKG_SCHEMA") {
            config.schema = Some(PathBuf::from(schema));
        }
        if let Some(v) = get("TENDERKG_CONCURRENCY") {
            config.concurrency = parse_var("TENDERKG_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("TENDERKG_MAX_RETRIES") {
            config.retry.max_retries = parse_var("TENDERKG_MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("TENDERKG_INITIAL_BACKOFF_MS") {
            config.retry.initial_backoff_ms = parse_var("TENDERKG_INITIAL_BACKOFF_MS", &v)?;
        }
        if let Some(v) = get("TENDERKG_MAX_BACKOFF_MS") {
            config.retry.max_backoff_ms = parse_var("TENDERKG_MAX_BACKOFF_MS", &v)?;
        }
        if let Some(v) = get("TENDERKG_STORE_TIMEOUT_MS") {
            config.store_timeout_ms = parse_var("TENDERKG_STORE_TIMEOUT_MS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.store_timeout_ms == 0 {
            return Err(Error::Config("store timeout must be positive".into()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::Config(format!(
                "initial backoff {}ms exceeds max backoff {}ms",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            )));
        }
        Ok(())
    }

    #[must_use]
    pub const fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// `<data dir>/tenderkg/graph.db`, or a relative path when no data dir exists.
#[must_use]
pub fn default_database_path() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from(".tenderkg").join("graph.db"),
        |d| d.join("tenderkg").join("graph.db"),
    )
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name}={raw:?} is not a valid number")))
}
