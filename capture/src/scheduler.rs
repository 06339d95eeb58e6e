use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::PipelineError;
use crate::event::EventRecord;
use crate::health::HealthHandle;
use crate::pipeline_config::ConfigManager;
use crate::prometheus::{report_commit_failure, report_commit_retry, report_committed_batch};
use crate::retry::RetryPolicy;
use crate::store::{CommitReceipt, Store};
use crate::time::TimeSource;

/// How often an idle committer reports itself alive.
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// State of the single-shot flush timer. `fire_at` is the only deadline there is;
/// re-arming or cancelling means overwriting this value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushTimer {
    Disarmed,
    Armed { fire_at: Instant },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Timer,
    Manual,
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

pub type CommitOutcome = Result<Option<CommitReceipt>, PipelineError>;
pub type ClearOutcome = Result<u64, PipelineError>;

/// A flushed batch on its way to the committer. An empty batch with an ack acts as
/// a barrier: it is acknowledged once every batch queued before it is done.
pub struct FlushedBatch {
    pub batch: Vec<EventRecord>,
    pub trigger: FlushTrigger,
    pub ack: Option<oneshot::Sender<CommitOutcome>>,
}

/// Work for the committer, applied strictly in the order it was queued.
pub enum CommitJob {
    Flush(FlushedBatch),
    /// Empties the store once every batch queued before it is committed.
    Clear { ack: oneshot::Sender<ClearOutcome> },
}

struct SchedulerState {
    pending: Vec<EventRecord>,
    timer: FlushTimer,
    // Present while a committer is running
    commits: Option<mpsc::UnboundedSender<CommitJob>>,
}

/// Accumulates accepted records and decides when they are flushed: as soon as
/// `batchSize` records are pending, or `flushIntervalMs` after the first record
/// of a batch arrived, whichever comes first.
///
/// Appending, deciding to flush and handing the batch to the committer happen under
/// one lock, so a batch is flushed exactly once and batches reach the store in the
/// order they were flushed.
pub struct BatchScheduler {
    state: Mutex<SchedulerState>,
    timer_changed: Notify,
    config: Arc<ConfigManager>,
}

impl BatchScheduler {
    pub fn new(config: Arc<ConfigManager>) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                pending: Vec::new(),
                timer: FlushTimer::Disarmed,
                commits: None,
            }),
            timer_changed: Notify::new(),
            config,
        }
    }

    pub(crate) fn attach(&self, commits: mpsc::UnboundedSender<CommitJob>) {
        self.lock().commits = Some(commits);
    }

    pub fn timer(&self) -> FlushTimer {
        self.lock().timer
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Appends records, in order, running the flush decision after each one.
    pub fn add(&self, records: Vec<EventRecord>) -> Result<(), PipelineError> {
        if records.is_empty() {
            return Ok(());
        }

        let config = self.config.get();
        let batch_size = config.batch_size.max(1);
        let mut state = self.lock();
        let commits = state.commits.clone().ok_or(PipelineError::NotRunning)?;
        let mut timer_changed = false;

        for record in records {
            state.pending.push(record);
            // A smaller batchSize may have been configured since the last add
            while state.pending.len() >= batch_size {
                let batch: Vec<EventRecord> = state.pending.drain(..batch_size).collect();
                hand_off(&commits, batch, FlushTrigger::Size, None);
                if state.timer != FlushTimer::Disarmed {
                    state.timer = FlushTimer::Disarmed;
                    timer_changed = true;
                }
            }
        }

        if !state.pending.is_empty() && state.timer == FlushTimer::Disarmed {
            state.timer = FlushTimer::Armed {
                fire_at: Instant::now() + config.flush_interval(),
            };
            timer_changed = true;
        }
        drop(state);

        if timer_changed {
            self.timer_changed.notify_one();
        }
        Ok(())
    }

    /// Flushes whatever is pending, even an empty list, and returns a receiver for
    /// the commit outcome.
    pub fn flush(
        &self,
        trigger: FlushTrigger,
    ) -> Result<oneshot::Receiver<CommitOutcome>, PipelineError> {
        self.flush_inner(trigger, false)
    }

    /// Final flush: hands over what is pending and disconnects the committer in the
    /// same step, so nothing can be added in between.
    pub(crate) fn close(&self) -> Result<oneshot::Receiver<CommitOutcome>, PipelineError> {
        self.flush_inner(FlushTrigger::Shutdown, true)
    }

    fn flush_inner(
        &self,
        trigger: FlushTrigger,
        detach: bool,
    ) -> Result<oneshot::Receiver<CommitOutcome>, PipelineError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        let commits = match detach {
            true => state.commits.take(),
            false => state.commits.clone(),
        }
        .ok_or(PipelineError::NotRunning)?;

        let batch = std::mem::take(&mut state.pending);
        state.timer = FlushTimer::Disarmed;
        hand_off(&commits, batch, trigger, Some(tx));
        drop(state);

        self.timer_changed.notify_one();
        Ok(rx)
    }

    /// Drops every pending record without committing it and, while a committer is
    /// attached, queues a store clear behind the batches already handed off.
    /// Without a committer there is nothing in flight and the caller clears the
    /// store itself.
    pub(crate) fn reset(&self) -> (usize, Option<oneshot::Receiver<ClearOutcome>>) {
        let mut state = self.lock();
        state.timer = FlushTimer::Disarmed;
        let discarded = std::mem::take(&mut state.pending).len();
        let cleared = state.commits.as_ref().map(|commits| {
            let (tx, rx) = oneshot::channel();
            if let Err(mpsc::error::SendError(CommitJob::Clear { ack })) =
                commits.send(CommitJob::Clear { ack: tx })
            {
                error!("committer is gone, store not cleared");
                if ack.send(Err(PipelineError::CommitterGone)).is_err() {
                    debug!("clear caller went away before the ack");
                }
            }
            rx
        });
        drop(state);
        self.timer_changed.notify_one();
        (discarded, cleared)
    }

    fn fire_due_timer(&self) {
        let mut state = self.lock();
        let FlushTimer::Armed { fire_at } = state.timer else {
            return;
        };
        if fire_at > Instant::now() {
            return;
        }

        state.timer = FlushTimer::Disarmed;
        if state.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut state.pending);
        match state.commits.clone() {
            Some(commits) => hand_off(&commits, batch, FlushTrigger::Timer, None),
            None => {
                // Detached between arming and firing; keep the records for the final flush
                state.pending = batch;
            }
        }
    }

    /// Sleeps until the armed deadline, or until the timer is re-armed or cancelled.
    pub async fn run_flush_timer(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            match self.timer() {
                FlushTimer::Disarmed => tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.timer_changed.notified() => {}
                },
                FlushTimer::Armed { fire_at } => tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.timer_changed.notified() => {}
                    _ = sleep_until(fire_at) => self.fire_due_timer(),
                },
            }
        }
        debug!("flush timer stopped");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn hand_off(
    commits: &mpsc::UnboundedSender<CommitJob>,
    batch: Vec<EventRecord>,
    trigger: FlushTrigger,
    ack: Option<oneshot::Sender<CommitOutcome>>,
) {
    debug!(batch_size = batch.len(), trigger = trigger.as_str(), "flushing batch");
    let job = CommitJob::Flush(FlushedBatch {
        batch,
        trigger,
        ack,
    });
    if let Err(mpsc::error::SendError(CommitJob::Flush(job))) = commits.send(job) {
        error!(
            batch_size = job.batch.len(),
            trigger = trigger.as_str(),
            "committer is gone, batch not committed"
        );
        report_commit_failure(trigger.as_str(), job.batch.len());
        if let Some(ack) = job.ack {
            if ack.send(Err(PipelineError::CommitterGone)).is_err() {
                debug!("flush caller went away before the ack");
            }
        }
    }
}

/// The single writer of batches: takes flushed batches in order, commits each one
/// with retries, then enforces the capacity limit.
pub struct Committer {
    store: Arc<Store>,
    config: Arc<ConfigManager>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    retry: RetryPolicy,
    liveness: Option<HealthHandle>,
}

impl Committer {
    pub fn new(
        store: Arc<Store>,
        config: Arc<ConfigManager>,
        timesource: Arc<dyn TimeSource + Send + Sync>,
        retry: RetryPolicy,
        liveness: Option<HealthHandle>,
    ) -> Self {
        Self {
            store,
            config,
            timesource,
            retry,
            liveness,
        }
    }

    /// Runs until every sender is dropped and the queue is empty.
    pub async fn run(self, mut jobs: mpsc::UnboundedReceiver<CommitJob>) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                job = jobs.recv() => match job {
                    Some(CommitJob::Flush(flushed)) => self.process(flushed).await,
                    Some(CommitJob::Clear { ack }) => self.clear(ack).await,
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if let Some(liveness) = &self.liveness {
                        liveness.report_healthy();
                    }
                }
            }
        }
        info!("committer stopped");
    }

    async fn process(&self, flushed: FlushedBatch) {
        let FlushedBatch {
            batch,
            trigger,
            ack,
        } = flushed;

        let outcome = if batch.is_empty() {
            Ok(None)
        } else {
            match self.commit_with_retry(&batch, trigger).await {
                Ok(receipt) => {
                    self.enforce_capacity().await;
                    Ok(Some(receipt))
                }
                Err(err) => {
                    let ids: Vec<&str> = batch.iter().map(|r| r.id.as_str()).collect();
                    error!(?ids, trigger = trigger.as_str(), "batch not committed: {}", err);
                    Err(err)
                }
            }
        };

        if let Some(liveness) = &self.liveness {
            match outcome {
                Ok(_) => liveness.report_healthy(),
                Err(_) => liveness.report_unhealthy(),
            }
        }
        if let Some(ack) = ack {
            if ack.send(outcome).is_err() {
                debug!("flush caller went away before the ack");
            }
        }
    }

    async fn clear(&self, ack: oneshot::Sender<ClearOutcome>) {
        let outcome = self.store.clear().await.map_err(PipelineError::from);
        if let Err(err) = &outcome {
            error!("failed to clear store: {}", err);
        }
        if ack.send(outcome).is_err() {
            debug!("clear caller went away before the ack");
        }
    }

    /// Retries the exact same batch; its records never go back to the pending list.
    #[instrument(skip_all, fields(batch_size = batch.len(), trigger = trigger.as_str()))]
    pub async fn commit_with_retry(
        &self,
        batch: &[EventRecord],
        trigger: FlushTrigger,
    ) -> Result<CommitReceipt, PipelineError> {
        let mut attempt = 0;
        loop {
            let started = std::time::Instant::now();
            match self.store.commit(batch, self.timesource.now()).await {
                Ok(receipt) => {
                    report_committed_batch(trigger.as_str(), batch.len(), started.elapsed());
                    return Ok(receipt);
                }
                Err(err) => {
                    attempt += 1;
                    if !err.is_retryable() || attempt >= self.retry.max_attempts() {
                        report_commit_failure(trigger.as_str(), batch.len());
                        return Err(PipelineError::CommitFailed {
                            size: batch.len(),
                            attempts: attempt,
                            source: err,
                        });
                    }

                    let wait = self.retry.time_until_next_retry(attempt - 1);
                    warn!(attempt, ?wait, "commit failed, retrying: {}", err);
                    report_commit_retry();
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    async fn enforce_capacity(&self) {
        let capacity = self.config.get().capacity;
        if let Err(err) = self.store.enforce_capacity(capacity).await {
            // Retried implicitly after the next commit
            warn!(capacity, "failed to enforce store capacity: {}", err);
        }
    }
}
