//! Configuration for the harvesting service

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::processing::ProgressPolicy;

/// Main service configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HarvestConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Chunking, concurrency and timeout configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Job retry policy
    #[serde(default)]
    pub retry: RetryConfig,
    /// Job database and artifact locations
    #[serde(default)]
    pub storage: StorageConfig,
    /// Link extraction configuration
    #[serde(default)]
    pub extraction: ExtractionConfig,
}

impl HarvestConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: HarvestConfig = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let p = &self.processing;
        if p.default_chunk_size == 0 {
            return Err(Error::Config("processing.default_chunk_size must be positive".into()));
        }
        if p.max_chunk_size < p.default_chunk_size {
            return Err(Error::Config(format!(
                "processing.max_chunk_size ({}) is below default_chunk_size ({})",
                p.max_chunk_size, p.default_chunk_size
            )));
        }
        if p.record_timeout_secs == 0 {
            return Err(Error::Config("processing.record_timeout_secs must be positive".into()));
        }
        if p.workers == 0 || p.queue_capacity == 0 {
            return Err(Error::Config("processing.workers and queue_capacity must be positive".into()));
        }
        if let ProgressPolicy::EveryItems { items: 0 } = p.progress {
            return Err(Error::Config("processing.progress.items must be positive".into()));
        }
        if self.extraction.key_column.trim().is_empty() {
            return Err(Error::Config("extraction.key_column must not be empty".into()));
        }
        if self.extraction.platforms.is_empty() {
            return Err(Error::Config("extraction.platforms must list at least one platform".into()));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Maximum upload size in bytes (default: 20MB)
    pub max_upload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            max_upload_size: 20 * 1024 * 1024,
        }
    }
}

/// Processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Records per chunk when the submission does not say
    pub default_chunk_size: usize,
    /// Largest chunk size a submission may request
    pub max_chunk_size: usize,
    /// Concurrent records inside one chunk (default: CPU count, max 8)
    pub parallel_records: Option<usize>,
    /// Timeout for a single record in seconds
    pub record_timeout_secs: u64,
    /// Number of background job workers
    pub workers: usize,
    /// Capacity of the job dispatch queue
    pub queue_capacity: usize,
    /// When chunk progress is pushed to subscribers
    pub progress: ProgressPolicy,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 10,
            max_chunk_size: 1000,
            parallel_records: None, // Auto-detect from CPU count
            record_timeout_secs: 10,
            workers: 2,
            queue_capacity: 1000,
            progress: ProgressPolicy::EveryChunk,
        }
    }
}

impl ProcessingConfig {
    /// Resolved intra-chunk concurrency
    pub fn parallel_records(&self) -> usize {
        self.parallel_records
            .unwrap_or_else(|| num_cpus::get().min(8))
            .max(1)
    }

    pub fn record_timeout(&self) -> Duration {
        Duration::from_secs(self.record_timeout_secs)
    }
}

/// Whole-job retry policy for processing-level failures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds
    pub backoff_ms: u64,
    /// Upper bound for the exponential delay
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl RetryConfig {
    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after a failed attempt (1-based): `backoff_ms * 2^(attempt-1)`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self.backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding job status records
    pub database_path: PathBuf,
    /// Directory where result spreadsheets are published
    pub artifact_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
            .join("link-harvest");

        Self {
            database_path: base.join("jobs.db"),
            artifact_dir: base.join("artifacts"),
        }
    }
}

/// A platform whose links are harvested
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlatformConfig {
    /// Output column name
    pub name: String,
    /// Substrings that identify the platform in an href
    pub patterns: Vec<String>,
}

impl PlatformConfig {
    pub fn new(name: &str, patterns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Link extraction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Column holding the domain to fetch
    pub key_column: String,
    /// User-Agent sent with page requests
    pub user_agent: String,
    /// Tracked platforms, in output column order
    pub platforms: Vec<PlatformConfig>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            key_column: "domain".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/86.0.4240.183 Safari/537.36"
                .to_string(),
            platforms: vec![
                PlatformConfig::new("Facebook", &["facebook.com"]),
                PlatformConfig::new("LinkedIn", &["linkedin.com"]),
                PlatformConfig::new("GitHub", &["github.com"]),
                PlatformConfig::new("Twitter", &["twitter.com", "x.com"]),
            ],
        }
    }
}
