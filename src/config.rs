use serde::Deserialize;
use std::path::Path;

/// Policy knobs loaded from `wide.toml`, overlaying defaults the way `WideConfig` always has
/// in this codebase. Connection strings and secrets stay in environment variables (see
/// `main.rs`); this file only carries the less frequently changed surface.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WideConfig {
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub scrubbing: ScrubbingConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_event_bytes")]
    pub max_event_bytes: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_event_bytes: default_max_event_bytes(),
        }
    }
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_max_event_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rate_limit_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_true")]
    pub fail_open: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_rate_limit_per_minute(),
            fail_open: true,
        }
    }
}

fn default_rate_limit_per_minute() -> u32 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_monthly_event_quota")]
    pub monthly_event_quota: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            monthly_event_quota: default_monthly_event_quota(),
        }
    }
}

fn default_monthly_event_quota() -> u64 {
    10_000_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScrubbingConfig {
    #[serde(default = "default_entropy_min_len")]
    pub high_entropy_min_len: usize,
}

impl Default for ScrubbingConfig {
    fn default() -> Self {
        Self {
            high_entropy_min_len: default_entropy_min_len(),
        }
    }
}

fn default_entropy_min_len() -> usize {
    32
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_rate_per_minute")]
    pub max_rate_per_minute: u32,
    #[serde(default = "default_layer3_timeout_secs")]
    pub layer3_timeout_secs: u64,
    #[serde(default = "default_layer4_timeout_secs")]
    pub layer4_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_concurrency(),
            max_rate_per_minute: default_rate_per_minute(),
            layer3_timeout_secs: default_layer3_timeout_secs(),
            layer4_timeout_secs: default_layer4_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_concurrency() -> usize {
    5
}

fn default_rate_per_minute() -> u32 {
    10
}

fn default_layer3_timeout_secs() -> u64 {
    30
}

fn default_layer4_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl WideConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: WideConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = WideConfig::load("/nonexistent/path/wide.toml").unwrap();
        assert_eq!(cfg.ingestion.max_batch_size, 1000);
        assert_eq!(cfg.worker.max_concurrency, 5);
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let toml_str = "[rate_limit]\nrequests_per_minute = 60\n";
        let cfg: WideConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.rate_limit.requests_per_minute, 60);
        assert_eq!(cfg.quota.monthly_event_quota, 10_000_000);
    }
}
