use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument, warn};

use crate::codec::Codec;
use crate::config::PipelineSettings;
use crate::dedup::Deduper;
use crate::error::PipelineError;
use crate::event::EventRecord;
use crate::health::HealthRegistry;
use crate::ingest::{Admission, IngestQueue};
use crate::pipeline_config::{ConfigManager, PipelineConfig, PipelineConfigUpdate};
use crate::prometheus::{report_corrupt_listing, report_received_events};
use crate::retry::RetryPolicy;
use crate::scheduler::{BatchScheduler, Committer, FlushTimer, FlushTrigger, HEARTBEAT_INTERVAL};
use crate::store::{CommitReceipt, KvBackend, Store, StoredEntry, STATUS_KEY};
use crate::sweeper::{RetentionSweeper, SweepReport};
use crate::time::TimeSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Active,
    Inactive,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Active => "active",
            PipelineStatus::Inactive => "inactive",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub status: PipelineStatus,
    pub pending: usize,
    pub throttled_backlog: usize,
    pub stored: usize,
    pub seen_ids: usize,
    pub flush_timer_armed: bool,
    pub sweeping: bool,
    pub config: PipelineConfig,
}

struct Running {
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// One capture pipeline: dedup, throttled ingestion, batching, the store and the
/// retention sweeper, wired together with an explicit start/stop lifecycle.
pub struct Pipeline {
    store: Arc<Store>,
    config: Arc<ConfigManager>,
    deduper: Arc<Deduper>,
    scheduler: Arc<BatchScheduler>,
    ingest: Arc<IngestQueue>,
    sweeper: Arc<RetentionSweeper>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    retry: RetryPolicy,
    sweep_interval: Duration,
    liveness: Option<HealthRegistry>,
    active: AtomicBool,
    lifecycle: Mutex<Option<Running>>,
}

impl Pipeline {
    /// Builds a stopped pipeline over `backend`. The runtime config is loaded from
    /// the backend, or seeded from `settings` on first use.
    pub async fn new(
        backend: Arc<dyn KvBackend>,
        codec: Arc<dyn Codec>,
        timesource: Arc<dyn TimeSource + Send + Sync>,
        settings: &PipelineSettings,
        liveness: Option<HealthRegistry>,
    ) -> Pipeline {
        let store = Arc::new(Store::new(backend, codec));
        let config = Arc::new(ConfigManager::load(store.clone(), settings.default_config()).await);
        let deduper = Arc::new(Deduper::new(settings.dedup_capacity()));
        let scheduler = Arc::new(BatchScheduler::new(config.clone()));
        let ingest = Arc::new(IngestQueue::new(
            deduper.clone(),
            scheduler.clone(),
            config.clone(),
            settings.throttle(),
        ));
        let sweeper = Arc::new(RetentionSweeper::new(
            store.clone(),
            config.clone(),
            timesource.clone(),
            settings.retention_basis,
            settings.sweep_interval(),
        ));

        Pipeline {
            store,
            config,
            deduper,
            scheduler,
            ingest,
            sweeper,
            timesource,
            retry: settings.retry_policy(),
            sweep_interval: settings.sweep_interval(),
            liveness,
            active: AtomicBool::new(false),
            lifecycle: Mutex::new(None),
        }
    }

    /// Spawns the committer, the flush timer, the drainer and the sweeper. The
    /// sweeper runs its first sweep right away.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        if let Ok(Some(previous)) = self.store.read_reserved(STATUS_KEY).await {
            if previous == PipelineStatus::Active.as_str() {
                warn!("previous run did not stop cleanly, uncommitted events were lost");
            }
        }

        let (commits, jobs) = mpsc::unbounded_channel();
        let committer = Committer::new(
            self.store.clone(),
            self.config.clone(),
            self.timesource.clone(),
            self.retry,
            self.liveness
                .as_ref()
                .map(|registry| registry.register("committer", HEARTBEAT_INTERVAL * 3)),
        );
        let sweeper_liveness = self.liveness.as_ref().map(|registry| {
            registry.register(
                "retention_sweeper",
                self.sweep_interval.saturating_mul(2) + Duration::from_secs(60),
            )
        });

        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();
        tasks.spawn(committer.run(jobs));
        self.scheduler.attach(commits);
        self.ingest.open();
        tasks.spawn(self.scheduler.clone().run_flush_timer(shutdown.clone()));
        tasks.spawn(self.ingest.clone().run_drainer(shutdown.clone()));
        tasks.spawn(
            self.sweeper
                .clone()
                .run(shutdown.clone(), sweeper_liveness),
        );
        tasks.close();

        self.active.store(true, Ordering::SeqCst);
        self.persist_status(PipelineStatus::Active).await;
        *lifecycle = Some(Running { shutdown, tasks });

        info!("pipeline started");
        Ok(())
    }

    /// Hands the throttled backlog to the scheduler, commits everything pending,
    /// then stops the background tasks. Returns the outcome of the final commit.
    pub async fn stop(&self) -> Result<Option<CommitReceipt>, PipelineError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            return Err(PipelineError::NotRunning);
        };
        self.active.store(false, Ordering::SeqCst);

        self.ingest.close_and_drain();
        running.shutdown.cancel();
        let outcome = match self.scheduler.close() {
            Ok(ack) => ack.await.unwrap_or(Err(PipelineError::CommitterGone)),
            Err(err) => Err(err),
        };
        // The committer exits once its queue is empty
        running.tasks.wait().await;

        if let Err(err) = &outcome {
            error!("final commit failed: {}", err);
        }
        self.persist_status(PipelineStatus::Inactive).await;
        info!("pipeline stopped");
        outcome
    }

    pub fn status(&self) -> PipelineStatus {
        match self.active.load(Ordering::SeqCst) {
            true => PipelineStatus::Active,
            false => PipelineStatus::Inactive,
        }
    }

    /// Records from a direct producer. Accepted records are pending in the
    /// scheduler when this returns.
    #[instrument(skip_all, fields(events = records.len()))]
    pub fn submit_event(&self, records: Vec<EventRecord>) -> Result<Vec<Admission>, PipelineError> {
        report_received_events("direct", records.len() as u64);
        self.ingest.enqueue(records)
    }

    /// Records from a throttled producer. Accepted records wait for the next drain.
    #[instrument(skip_all, fields(events = records.len()))]
    pub fn submit_throttled(
        &self,
        records: Vec<EventRecord>,
    ) -> Result<Vec<Admission>, PipelineError> {
        report_received_events("throttled", records.len() as u64);
        self.ingest.enqueue_throttled(records)
    }

    /// Commits whatever the scheduler holds and waits for the outcome. Records
    /// still in the throttled backlog keep waiting for their drain.
    pub async fn flush(&self) -> Result<Option<CommitReceipt>, PipelineError> {
        let ack = self.scheduler.flush(FlushTrigger::Manual)?;
        ack.await.unwrap_or(Err(PipelineError::CommitterGone))
    }

    pub fn get_config(&self) -> PipelineConfig {
        self.config.get()
    }

    pub async fn update_config(
        &self,
        update: PipelineConfigUpdate,
    ) -> Result<PipelineConfig, PipelineError> {
        Ok(self.config.update(update).await?)
    }

    /// Every stored entry, oldest first, still encoded.
    pub async fn list_entries(&self) -> Result<Vec<StoredEntry>, PipelineError> {
        Ok(self.store.read_all().await?)
    }

    /// Stored entries inserted within `[from, to)`.
    pub async fn list_range(
        &self,
        from: Option<OffsetDateTime>,
        to: Option<OffsetDateTime>,
    ) -> Result<Vec<StoredEntry>, PipelineError> {
        Ok(self.store.read_range(from, to).await?)
    }

    /// Decoded records, newest `occurred_at` first. Entries that fail to decode are
    /// logged and skipped; the next sweep removes them.
    pub async fn list_records(&self) -> Result<Vec<EventRecord>, PipelineError> {
        let entries = self.store.read_all().await?;
        let mut corrupt = 0;
        let mut records: Vec<EventRecord> = entries
            .iter()
            .rev()
            .filter_map(|entry| match self.store.decode(entry) {
                Ok(record) => Some(record),
                Err(err) => {
                    corrupt += 1;
                    warn!(key = %entry.key, "skipping undecodable entry: {}", err);
                    None
                }
            })
            .collect();
        if corrupt > 0 {
            report_corrupt_listing(corrupt);
        }

        // Stable, so ties stay newest-inserted first
        records.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        Ok(records)
    }

    /// Hard reset: drops uncommitted records, forgets every seen id and empties
    /// the store. Batches handed to the committer before the reset are committed
    /// and then removed along with everything else.
    #[instrument(skip_all)]
    pub async fn clear_all(&self) -> Result<u64, PipelineError> {
        let (backlog, pending, cleared) = self.ingest.reset();
        let removed = match cleared {
            Some(cleared) => cleared.await.unwrap_or(Err(PipelineError::CommitterGone))?,
            None => self.store.clear().await?,
        };

        info!(backlog, pending, removed, "cleared all captured events");
        Ok(removed)
    }

    /// Runs a retention sweep now. `None` when one is already running.
    pub async fn sweep_now(&self) -> Result<Option<SweepReport>, PipelineError> {
        Ok(self.sweeper.sweep_once().await?)
    }

    pub async fn stats(&self) -> Result<PipelineStats, PipelineError> {
        Ok(PipelineStats {
            status: self.status(),
            pending: self.scheduler.pending_len(),
            throttled_backlog: self.ingest.backlog_len(),
            stored: self.store.count().await?,
            seen_ids: self.deduper.len(),
            flush_timer_armed: self.scheduler.timer() != FlushTimer::Disarmed,
            sweeping: self.sweeper.is_sweeping(),
            config: self.config.get(),
        })
    }

    pub fn timesource(&self) -> &(dyn TimeSource + Send + Sync) {
        self.timesource.as_ref()
    }

    async fn persist_status(&self, status: PipelineStatus) {
        if let Err(err) = self
            .store
            .write_reserved(STATUS_KEY, status.as_str().to_string())
            .await
        {
            warn!(status = status.as_str(), "failed to persist pipeline status: {}", err);
        }
    }
}
