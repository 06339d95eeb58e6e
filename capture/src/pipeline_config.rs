use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::prometheus::report_config_persist_failure;
use crate::store::{Store, CONFIG_KEY};

pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_CAPACITY: usize = 1_000;
pub const DEFAULT_RETENTION_MS: u64 = 7 * 24 * 60 * 60 * 1_000;

/// Parameters that can change while the pipeline runs. Each scheduling or eviction
/// decision reads a fresh copy; work already in flight keeps the copy it read.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub capacity: usize,
    pub retention_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            capacity: DEFAULT_CAPACITY,
            retention_ms: DEFAULT_RETENTION_MS,
        }
    }
}

impl PipelineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::MustBePositive {
                field: "batchSize",
            });
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::MustBePositive {
                field: "flushIntervalMs",
            });
        }
        if self.capacity == 0 {
            return Err(ConfigError::MustBePositive { field: "capacity" });
        }
        Ok(())
    }

    /// Copy of `self` with every field set in `update` replaced.
    pub fn merge(&self, update: &PipelineConfigUpdate) -> Result<PipelineConfig, ConfigError> {
        let merged = PipelineConfig {
            batch_size: update.batch_size.unwrap_or(self.batch_size),
            flush_interval_ms: update.flush_interval_ms.unwrap_or(self.flush_interval_ms),
            capacity: update.capacity.unwrap_or(self.capacity),
            retention_ms: update.retention_ms.unwrap_or(self.retention_ms),
        };
        merged.validate()?;
        Ok(merged)
    }
}

/// A partial config: absent fields keep their current value.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfigUpdate {
    pub batch_size: Option<usize>,
    pub flush_interval_ms: Option<u64>,
    pub capacity: Option<usize>,
    pub retention_ms: Option<u64>,
}

/// Holds the live config and mirrors it into the store under [`CONFIG_KEY`].
///
/// Storage trouble never makes the config unavailable: a failed load falls back to
/// the defaults and a failed write keeps the merged value in memory.
pub struct ConfigManager {
    current: RwLock<PipelineConfig>,
    store: Arc<Store>,
    // Serializes read-merge-write cycles of concurrent updates
    updates: Mutex<()>,
}

impl ConfigManager {
    pub async fn load(store: Arc<Store>, defaults: PipelineConfig) -> ConfigManager {
        // Only a missing or unusable value gets overwritten, never one we failed to read
        let (current, seed) = match store.read_reserved(CONFIG_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<PipelineConfig>(&raw) {
                Ok(config) if config.validate().is_ok() => (Some(config), false),
                Ok(config) => {
                    warn!(?config, "stored config is invalid, using defaults");
                    (None, true)
                }
                Err(err) => {
                    warn!("stored config is unreadable, using defaults: {}", err);
                    (None, true)
                }
            },
            Ok(None) => (None, true),
            Err(err) => {
                warn!("failed to read stored config, using defaults: {}", err);
                (None, false)
            }
        };

        let manager = ConfigManager {
            current: RwLock::new(current.unwrap_or(defaults)),
            store,
            updates: Mutex::new(()),
        };
        if seed {
            info!(config = ?defaults, "seeding pipeline config");
            manager.persist(&defaults).await;
        }
        manager
    }

    pub fn get(&self) -> PipelineConfig {
        *self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merges `update` into the current config, persists it and returns the result.
    pub async fn update(&self, update: PipelineConfigUpdate) -> Result<PipelineConfig, ConfigError> {
        let _guard = self.updates.lock().await;
        let merged = self.get().merge(&update)?;
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = merged;

        info!(config = ?merged, "pipeline config updated");
        self.persist(&merged).await;
        Ok(merged)
    }

    async fn persist(&self, config: &PipelineConfig) {
        let result = match serde_json::to_string(config) {
            Ok(raw) => self.store.write_reserved(CONFIG_KEY, raw).await,
            Err(err) => {
                warn!("failed to serialize pipeline config: {}", err);
                return;
            }
        };
        if let Err(err) = result {
            report_config_persist_failure();
            warn!(
                "failed to persist pipeline config, keeping it in memory: {}",
                err
            );
        }
    }
}
