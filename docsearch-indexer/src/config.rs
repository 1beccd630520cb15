//! Indexer configuration, loaded from TOML.
//!
//! Every field is optional in the file; missing fields take the defaults below.
//!
//! ```toml
//! concurrency = 6
//! memory_watermark_mb = 1024
//! embedder_pool_size = 2
//! chunk_target_size = 256
//! chunk_overlap = 32
//! embed_batch_size = 8
//!
//! [model]
//! model = { kind = "fast_embed", model_name = "bge-small-en-v1.5" }
//!
//! [retry_profile]
//! strategy = "exponential"
//! max_attempts = 5
//! ```

use crate::retrieval::parser::PARSER_VERSION;
use anyhow::{Context, Result, bail};
use docsearch_embed::{EmbedConfig, PoolConfig};
use docsearch_retry::{RetryProfile, StrategyKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Worker timeouts, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerTimeouts {
    pub embed_timeout_ms: u64,
    pub spawn_timeout_ms: u64,
    pub ready_wait_timeout_ms: u64,
    /// Zero disables health checks.
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    pub shutdown_drain_timeout_ms: u64,
}

impl Default for WorkerTimeouts {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            embed_timeout_ms: pool.embed_timeout_ms,
            spawn_timeout_ms: pool.spawn_timeout_ms,
            ready_wait_timeout_ms: pool.ready_wait_timeout_ms,
            health_check_interval_ms: pool.health_check_interval_ms,
            health_check_timeout_ms: pool.health_check_timeout_ms,
            shutdown_drain_timeout_ms: pool.shutdown_drain_timeout_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Files processed at once. `None` means `max(cores - 1, 4)`.
    pub concurrency: Option<usize>,
    /// Below this much available system memory, concurrency drops to a quarter.
    pub memory_watermark_mb: u64,
    pub embedder_pool_size: usize,
    pub max_files_before_worker_restart: u64,
    pub max_worker_memory_mb: u64,
    /// Target chunk size in estimated tokens.
    pub chunk_target_size: usize,
    pub chunk_overlap: usize,
    /// Chunks per embed call.
    pub embed_batch_size: usize,
    /// Files indexed by an older parser version are re-indexed.
    pub parser_version: u32,
    /// How long a file stays in `error` before it is retried.
    pub error_retry_interval_secs: u64,
    /// Nearest neighbors fetched per requested result.
    pub search_oversample: usize,
    pub max_chunks_per_file: usize,
    /// How long shutdown waits for in-flight files.
    pub shutdown_timeout_secs: u64,
    pub max_queue_size: usize,
    pub watch_debounce_ms: u64,
    /// Run embedding workers as tasks instead of subprocesses.
    pub in_process_workers: bool,
    pub model: EmbedConfig,
    pub worker: WorkerTimeouts,
    /// Applied to each embed call made while indexing.
    pub retry_profile: RetryProfile,
    /// Applied to query embedding during search.
    pub query_retry_profile: RetryProfile,
    /// Applied inside the embedder pool.
    pub pool_retry_profile: RetryProfile,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            memory_watermark_mb: 512,
            embedder_pool_size: 2,
            max_files_before_worker_restart: 1_000,
            max_worker_memory_mb: 2_048,
            chunk_target_size: 256,
            chunk_overlap: 32,
            embed_batch_size: 8,
            parser_version: PARSER_VERSION,
            error_retry_interval_secs: 300,
            search_oversample: 8,
            max_chunks_per_file: 3,
            shutdown_timeout_secs: 30,
            max_queue_size: 100_000,
            watch_debounce_ms: 2_000,
            in_process_workers: false,
            model: EmbedConfig::default(),
            worker: WorkerTimeouts::default(),
            retry_profile: RetryProfile::new(StrategyKind::JitteredExponential)
                .with_max_attempts(4)
                .with_delays(Duration::from_millis(500), Duration::from_secs(30)),
            query_retry_profile: RetryProfile::new(StrategyKind::Exponential)
                .with_max_attempts(2)
                .with_delays(Duration::from_millis(100), Duration::from_secs(1)),
            pool_retry_profile: PoolConfig::default().retry,
        }
    }
}

/// `max(cores - 1, 4)`.
pub fn default_concurrency() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cores.saturating_sub(1).max(4)
}

impl IndexerConfig {
    /// Load a TOML config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&text)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, overridden by `path` when it exists.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_target_size == 0 {
            bail!("chunk_target_size must be at least 1");
        }
        if self.chunk_overlap >= self.chunk_target_size {
            bail!(
                "chunk_overlap ({}) must be smaller than chunk_target_size ({})",
                self.chunk_overlap,
                self.chunk_target_size
            );
        }
        if self.embed_batch_size == 0 {
            bail!("embed_batch_size must be at least 1");
        }
        if self.embedder_pool_size == 0 {
            bail!("embedder_pool_size must be at least 1");
        }
        if self.concurrency == Some(0) {
            bail!("concurrency must be at least 1");
        }
        self.model
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid model config: {e}"))?;
        Ok(())
    }

    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.unwrap_or_else(default_concurrency)
    }

    /// Concurrency while available memory is under the watermark.
    pub fn throttled_concurrency(&self) -> usize {
        (self.effective_concurrency() / 4).max(1)
    }

    pub fn search_oversample(&self) -> usize {
        self.search_oversample.clamp(5, 10)
    }

    pub fn error_retry_interval(&self) -> Duration {
        Duration::from_secs(self.error_retry_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn memory_watermark_bytes(&self) -> u64 {
        self.memory_watermark_mb.saturating_mul(1024 * 1024)
    }

    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            pool_size: self.embedder_pool_size,
            max_files_before_restart: self.max_files_before_worker_restart,
            max_worker_memory_mb: self.max_worker_memory_mb,
            embed_timeout_ms: self.worker.embed_timeout_ms,
            spawn_timeout_ms: self.worker.spawn_timeout_ms,
            ready_wait_timeout_ms: self.worker.ready_wait_timeout_ms,
            health_check_interval_ms: self.worker.health_check_interval_ms,
            health_check_timeout_ms: self.worker.health_check_timeout_ms,
            shutdown_drain_timeout_ms: self.worker.shutdown_drain_timeout_ms,
            retry: self.pool_retry_profile.clone(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_model(mut self, model: EmbedConfig) -> Self {
        self.model = model;
        self
    }

    pub fn with_chunking(mut self, target_size: usize, overlap: usize) -> Self {
        self.chunk_target_size = target_size;
        self.chunk_overlap = overlap;
        self
    }

    pub fn with_embed_batch_size(mut self, batch_size: usize) -> Self {
        self.embed_batch_size = batch_size;
        self
    }

    pub fn with_retry_profile(mut self, profile: RetryProfile) -> Self {
        self.retry_profile = profile;
        self
    }

    pub fn with_parser_version(mut self, version: u32) -> Self {
        self.parser_version = version;
        self
    }

    pub fn with_error_retry_interval(mut self, interval: Duration) -> Self {
        self.error_retry_interval_secs = interval.as_secs();
        self
    }

    pub fn with_in_process_workers(mut self, enabled: bool) -> Self {
        self.in_process_workers = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = IndexerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.embed_batch_size, 8);
        assert!(config.effective_concurrency() >= 4);
        assert_eq!(config.search_oversample(), 8);
    }

    #[test]
    fn test_load_partial_toml() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("docsearch.toml");
        std::fs::write(
            &path,
            r#"
concurrency = 2
chunk_target_size = 64
chunk_overlap = 8
search_oversample = 50

[model]
model = { kind = "hashing", dimension = 32 }

[retry_profile]
strategy = "linear"
max_attempts = 2
"#,
        )?;

        let config = IndexerConfig::load(&path)?;
        assert_eq!(config.effective_concurrency(), 2);
        assert_eq!(config.throttled_concurrency(), 1);
        assert_eq!(config.chunk_target_size, 64);
        assert_eq!(config.model.model_name(), "hashing-32");
        assert_eq!(config.retry_profile.strategy, StrategyKind::Linear);
        assert_eq!(config.retry_profile.max_attempts, 2);
        assert_eq!(config.search_oversample(), 10);
        assert_eq!(config.embed_batch_size, 8);
        Ok(())
    }

    #[test]
    fn test_invalid_chunking_rejected() {
        let config = IndexerConfig::default().with_chunking(32, 32);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_config_mapping() {
        let mut config = IndexerConfig::default();
        config.embedder_pool_size = 3;
        config.max_files_before_worker_restart = 7;
        let pool = config.to_pool_config();
        assert_eq!(pool.pool_size, 3);
        assert_eq!(pool.max_files_before_restart, 7);
        assert_eq!(pool.retry, config.pool_retry_profile);
    }

    #[test]
    fn test_missing_file_gives_defaults() -> Result<()> {
        let dir = tempdir()?;
        let config = IndexerConfig::load_or_default(&dir.path().join("absent.toml"))?;
        assert_eq!(config, IndexerConfig::default());
        Ok(())
    }
}
