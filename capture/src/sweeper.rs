use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::StoreError;
use crate::health::HealthHandle;
use crate::pipeline_config::ConfigManager;
use crate::prometheus::report_sweep;
use crate::store::{parse_entry_key, Store};
use crate::time::TimeSource;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Which timestamp an entry's age is measured from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RetentionBasis {
    /// Commit time, recovered from the entry key
    #[default]
    InsertedAt,
    /// The record's own `occurred_at`
    OccurredAt,
}

impl FromStr for RetentionBasis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "inserted_at" => Ok(RetentionBasis::InsertedAt),
            "occurred_at" => Ok(RetentionBasis::OccurredAt),
            _ => Err(format!("Unknown retention basis: {s}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub corrupt: usize,
    pub removed: u64,
}

/// Periodically removes entries older than `retentionMs`, plus any entry that
/// can't be decoded. Independent of capacity eviction.
pub struct RetentionSweeper {
    store: Arc<Store>,
    config: Arc<ConfigManager>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    basis: RetentionBasis,
    interval: Duration,
    // Held for the duration of a sweep: Idle when unlocked, Sweeping when locked
    sweeping: Mutex<()>,
}

impl RetentionSweeper {
    pub fn new(
        store: Arc<Store>,
        config: Arc<ConfigManager>,
        timesource: Arc<dyn TimeSource + Send + Sync>,
        basis: RetentionBasis,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            config,
            timesource,
            basis,
            interval,
            sweeping: Mutex::new(()),
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeping.try_lock().is_err()
    }

    /// Runs one sweep. Returns `None` when another sweep is already in progress.
    #[instrument(skip_all)]
    pub async fn sweep_once(&self) -> Result<Option<SweepReport>, StoreError> {
        let Ok(_sweeping) = self.sweeping.try_lock() else {
            debug!("retention sweep already running, skipping");
            return Ok(None);
        };

        let retention = self.config.get().retention();
        let now = self.timesource.now();
        // A retention too large to represent expires nothing
        let cutoff = time::Duration::try_from(retention)
            .ok()
            .and_then(|retention| now.checked_sub(retention));

        let entries = self.store.read_raw().await?;
        let mut report = SweepReport {
            scanned: entries.len(),
            ..Default::default()
        };
        let mut doomed = Vec::new();

        for (key, encoded) in entries {
            let inserted_at = parse_entry_key(&key)
                .and_then(|(stamp, _)| OffsetDateTime::from_unix_timestamp_nanos(stamp).ok());
            let Some(inserted_at) = inserted_at else {
                warn!(key = %key, "removing entry with malformed key");
                report.corrupt += 1;
                doomed.push(key);
                continue;
            };
            let record = match self.store.codec().decode(&encoded) {
                Ok(record) => record,
                Err(err) => {
                    warn!(key = %key, "removing undecodable entry: {}", err);
                    report.corrupt += 1;
                    doomed.push(key);
                    continue;
                }
            };

            let age_from = match self.basis {
                RetentionBasis::InsertedAt => inserted_at,
                RetentionBasis::OccurredAt => record.occurred_at,
            };
            if cutoff.is_some_and(|cutoff| age_from < cutoff) {
                report.expired += 1;
                doomed.push(key);
            }
        }

        if !doomed.is_empty() {
            report.removed = self.store.remove(&doomed).await?;
        }
        report_sweep(report.expired, report.corrupt);
        info!(
            scanned = report.scanned,
            expired = report.expired,
            corrupt = report.corrupt,
            removed = report.removed,
            "retention sweep done"
        );
        Ok(Some(report))
    }

    /// Sweeps once right away, then every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken, liveness: Option<HealthHandle>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.sweep_once().await {
                        Ok(_) => {
                            if let Some(liveness) = &liveness {
                                liveness.report_healthy();
                            }
                        }
                        Err(err) => error!("retention sweep failed: {}", err),
                    }
                }
            }
        }
        debug!("retention sweeper stopped");
    }
}
