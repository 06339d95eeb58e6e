use std::net::SocketAddr;
use std::time::Duration;

use envconfig::Envconfig;
use tracing::Level;

use crate::codec::CodecKind;
use crate::pipeline_config::PipelineConfig;
use crate::retry::RetryPolicy;
use crate::sweeper::RetentionBasis;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3000")]
    pub address: SocketAddr,

    #[envconfig(default = "capture-pipeline.db")]
    pub store_path: String,

    // Keep everything in process memory, for local runs and tests
    #[envconfig(default = "false")]
    pub memory_store: bool,

    #[envconfig(default = "base64_json")]
    pub store_codec: CodecKind,

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "capture-pipeline")]
    pub otel_service_name: String,

    // Used for integration tests
    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "info")]
    pub log_level: Level,

    #[envconfig(nested = true)]
    pub pipeline: PipelineSettings,
}

/// Process-level tuning of the pipeline. The `default_*` values only seed the
/// runtime config on first start; after that the stored config wins.
#[derive(Envconfig, Clone, Debug)]
pub struct PipelineSettings {
    #[envconfig(default = "20")]
    pub default_batch_size: usize,
    #[envconfig(default = "2000")]
    pub default_flush_interval_ms: u64,
    #[envconfig(default = "1000")]
    pub default_capacity: usize,
    #[envconfig(default = "604800000")]
    pub default_retention_ms: u64, // 7 days

    #[envconfig(default = "500")]
    pub throttle_ms: u64,
    #[envconfig(default = "1800000")]
    pub retention_sweep_interval_ms: u64, // 30 minutes
    #[envconfig(default = "inserted_at")]
    pub retention_basis: RetentionBasis,

    // 0 keeps every seen id
    #[envconfig(default = "0")]
    pub dedup_capacity: usize,

    #[envconfig(default = "3")]
    pub commit_max_attempts: u32,
    #[envconfig(default = "100")]
    pub commit_retry_initial_ms: u64,
    #[envconfig(default = "5000")]
    pub commit_retry_max_ms: u64,
}

impl PipelineSettings {
    pub fn default_config(&self) -> PipelineConfig {
        PipelineConfig {
            batch_size: self.default_batch_size,
            flush_interval_ms: self.default_flush_interval_ms,
            capacity: self.default_capacity,
            retention_ms: self.default_retention_ms,
        }
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        // tokio intervals panic on a zero period
        Duration::from_millis(self.retention_sweep_interval_ms.max(1))
    }

    pub fn dedup_capacity(&self) -> Option<usize> {
        Some(self.dedup_capacity).filter(|capacity| *capacity > 0)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.commit_max_attempts,
            2,
            Duration::from_millis(self.commit_retry_initial_ms),
            Some(Duration::from_millis(self.commit_retry_max_ms)),
        )
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let config = PipelineConfig::default();
        Self {
            default_batch_size: config.batch_size,
            default_flush_interval_ms: config.flush_interval_ms,
            default_capacity: config.capacity,
            default_retention_ms: config.retention_ms,
            throttle_ms: 500,
            retention_sweep_interval_ms: 30 * 60 * 1000,
            retention_basis: RetentionBasis::InsertedAt,
            dedup_capacity: 0,
            commit_max_attempts: 3,
            commit_retry_initial_ms: 100,
            commit_retry_max_ms: 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_runtime_defaults() {
        let settings = PipelineSettings::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(settings.default_config(), PipelineConfig::default());
        assert_eq!(settings.throttle(), Duration::from_millis(500));
        assert_eq!(settings.sweep_interval(), Duration::from_secs(30 * 60));
        assert_eq!(settings.retention_basis, RetentionBasis::InsertedAt);
        assert_eq!(settings.dedup_capacity(), None);
        assert_eq!(settings.retry_policy().max_attempts(), 3);
    }

    #[test]
    fn reads_overrides() {
        let env = HashMap::from([
            ("ADDRESS".to_string(), "0.0.0.0:8080".to_string()),
            ("MEMORY_STORE".to_string(), "true".to_string()),
            ("STORE_CODEC".to_string(), "json".to_string()),
            ("THROTTLE_MS".to_string(), "250".to_string()),
            ("RETENTION_BASIS".to_string(), "occurred_at".to_string()),
            ("DEDUP_CAPACITY".to_string(), "10000".to_string()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.address.port(), 8080);
        assert!(config.memory_store);
        assert_eq!(config.store_codec, CodecKind::Json);
        assert_eq!(config.pipeline.throttle_ms, 250);
        assert_eq!(config.pipeline.retention_basis, RetentionBasis::OccurredAt);
        assert_eq!(config.pipeline.dedup_capacity(), Some(10_000));
        assert_eq!(config.otel_url, None);
    }

    #[test]
    fn rejects_unknown_codec() {
        let env = HashMap::from([("STORE_CODEC".to_string(), "xml".to_string())]);
        assert!(Config::init_from_hashmap(&env).is_err());
    }
}
