//! Configuration for embedding models and the worker pool

use crate::error::{EmbedError, Result};
use docsearch_retry::{RetryProfile, StrategyKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Largest batch a worker hands to the model in one call.
pub const MAX_MODEL_BATCH: usize = 128;

/// Which model a worker loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    /// A FastEmbed ONNX model, downloaded into `cache_dir` on first use.
    FastEmbed {
        model_name: String,
        #[serde(default)]
        cache_dir: Option<PathBuf>,
    },
    /// Deterministic feature-hashing vectors; no model files needed.
    Hashing { dimension: usize },
}

impl Default for ModelSpec {
    fn default() -> Self {
        ModelSpec::FastEmbed {
            model_name: "all-minilm-l6-v2".to_string(),
            cache_dir: None,
        }
    }
}

/// Model settings sent to every worker in its `init` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    pub model: ModelSpec,
    /// L2-normalize every vector before returning it.
    pub normalize: bool,
    /// Texts per model call inside the worker.
    pub batch_size: usize,
    /// Overrides the model's default prefix for query texts.
    pub query_prefix: Option<String>,
    /// Overrides the model's default prefix for indexed passages.
    pub passage_prefix: Option<String>,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            model: ModelSpec::default(),
            normalize: true,
            batch_size: 32,
            query_prefix: None,
            passage_prefix: None,
        }
    }
}

impl EmbedConfig {
    pub fn fastembed(model_name: impl Into<String>) -> Self {
        Self {
            model: ModelSpec::FastEmbed {
                model_name: model_name.into(),
                cache_dir: None,
            },
            ..Self::default()
        }
    }

    pub fn hashing(dimension: usize) -> Self {
        Self {
            model: ModelSpec::Hashing { dimension },
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        if let ModelSpec::FastEmbed { cache_dir, .. } = &mut self.model {
            *cache_dir = Some(dir.into());
        }
        self
    }

    pub fn model_name(&self) -> String {
        match &self.model {
            ModelSpec::FastEmbed { model_name, .. } => model_name.clone(),
            ModelSpec::Hashing { dimension } => format!("hashing-{dimension}"),
        }
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_MODEL_BATCH)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be at least 1"));
        }
        match &self.model {
            ModelSpec::Hashing { dimension: 0 } => Err(EmbedError::invalid_config(
                "hashing model dimension must be at least 1",
            )),
            ModelSpec::FastEmbed { model_name, .. } if model_name.trim().is_empty() => {
                Err(EmbedError::invalid_config("model_name must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

/// Sizing, limits and timeouts of the [`crate::EmbedderPool`].
///
/// All durations are in milliseconds so they read naturally in TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub pool_size: usize,
    /// Embed calls a worker serves before it is recycled.
    pub max_files_before_restart: u64,
    /// Resident memory above which a worker is recycled.
    pub max_worker_memory_mb: u64,
    pub embed_timeout_ms: u64,
    pub spawn_timeout_ms: u64,
    /// How long `embed` waits for a ready worker before `PoolUnavailable`.
    pub ready_wait_timeout_ms: u64,
    /// Zero disables health checks.
    pub health_check_interval_ms: u64,
    pub health_check_timeout_ms: u64,
    pub shutdown_drain_timeout_ms: u64,
    /// Applied to pool-level failures before they reach callers.
    pub retry: RetryProfile,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            max_files_before_restart: 1_000,
            max_worker_memory_mb: 2_048,
            embed_timeout_ms: 60_000,
            spawn_timeout_ms: 300_000,
            ready_wait_timeout_ms: 30_000,
            health_check_interval_ms: 30_000,
            health_check_timeout_ms: 5_000,
            shutdown_drain_timeout_ms: 10_000,
            retry: RetryProfile::new(StrategyKind::JitteredExponential)
                .with_max_attempts(3)
                .with_delays(Duration::from_millis(100), Duration::from_secs(2)),
        }
    }
}

impl PoolConfig {
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_max_files_before_restart(mut self, limit: u64) -> Self {
        self.max_files_before_restart = limit;
        self
    }

    pub fn with_max_worker_memory_mb(mut self, limit: u64) -> Self {
        self.max_worker_memory_mb = limit;
        self
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_ready_wait_timeout(mut self, timeout: Duration) -> Self {
        self.ready_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.health_check_interval_ms = interval.map_or(0, |d| d.as_millis() as u64);
        self
    }

    pub fn with_shutdown_drain_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, retry: RetryProfile) -> Self {
        self.retry = retry;
        self
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn ready_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_wait_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0)
            .then(|| Duration::from_millis(self.health_check_interval_ms))
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_timeout_ms)
    }

    pub fn max_worker_memory_bytes(&self) -> u64 {
        self.max_worker_memory_mb.saturating_mul(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EmbedConfig::default();
        assert_eq!(config.model_name(), "all-minilm-l6-v2");
        assert!(config.normalize);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_batch_size_is_capped() {
        let config = EmbedConfig::hashing(64).with_batch_size(10_000);
        assert_eq!(config.effective_batch_size(), MAX_MODEL_BATCH);
        assert!(EmbedConfig::hashing(64).with_batch_size(0).validate().is_err());
        assert!(EmbedConfig::hashing(0).validate().is_err());
    }

    #[test]
    fn test_config_json_shape() {
        let config = EmbedConfig::hashing(16);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["model"]["kind"], "hashing");
        assert_eq!(json["model"]["dimension"], 16);

        let parsed: EmbedConfig =
            serde_json::from_str(r#"{"model":{"kind":"fast_embed","model_name":"bge-small-en-v1.5"}}"#)
                .unwrap();
        assert_eq!(parsed.model_name(), "bge-small-en-v1.5");
        assert_eq!(parsed.batch_size, EmbedConfig::default().batch_size);
    }

    #[test]
    fn test_pool_durations() {
        let config = PoolConfig::default().with_health_check_interval(None);
        assert_eq!(config.health_check_interval(), None);
        assert_eq!(config.embed_timeout(), Duration::from_secs(60));
        assert_eq!(config.max_worker_memory_bytes(), 2_048 * 1024 * 1024);
    }
}
