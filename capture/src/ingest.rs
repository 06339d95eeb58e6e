use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dedup::Deduper;
use crate::error::PipelineError;
use crate::event::EventRecord;
use crate::pipeline_config::ConfigManager;
use crate::prometheus::report_drain;
use crate::scheduler::{BatchScheduler, ClearOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Already seen, dropped without error
    Duplicate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainTimer {
    Disarmed,
    Armed { drain_at: Instant },
}

struct DrainState {
    backlog: VecDeque<EventRecord>,
    timer: DrainTimer,
    last_drain_at: Option<Instant>,
    accepting: bool,
}

/// Entry point for every producer. Records go through the [`Deduper`] and then
/// either straight to the [`BatchScheduler`] or, for throttled producers, into a
/// backlog that is drained at most once per throttle window.
///
/// Admitting a record and handing it on happen under a shared `admission` guard;
/// [`IngestQueue::reset`] takes it exclusively, so no record can be admitted on one
/// side of a reset and reach the store on the other.
pub struct IngestQueue {
    admission: RwLock<()>,
    deduper: Arc<Deduper>,
    scheduler: Arc<BatchScheduler>,
    config: Arc<ConfigManager>,
    throttle: Duration,
    drain: Mutex<DrainState>,
    drain_changed: Notify,
}

impl IngestQueue {
    pub fn new(
        deduper: Arc<Deduper>,
        scheduler: Arc<BatchScheduler>,
        config: Arc<ConfigManager>,
        throttle: Duration,
    ) -> Self {
        Self {
            admission: RwLock::new(()),
            deduper,
            scheduler,
            config,
            throttle,
            drain: Mutex::new(DrainState {
                backlog: VecDeque::new(),
                timer: DrainTimer::Disarmed,
                last_drain_at: None,
                accepting: false,
            }),
            drain_changed: Notify::new(),
        }
    }

    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    pub fn drain_timer(&self) -> DrainTimer {
        self.lock().timer
    }

    pub fn backlog_len(&self) -> usize {
        self.lock().backlog.len()
    }

    /// Direct path: admitted records reach the scheduler before this returns.
    pub fn enqueue(&self, records: Vec<EventRecord>) -> Result<Vec<Admission>, PipelineError> {
        let _admission = self.admission.read().unwrap_or_else(PoisonError::into_inner);
        let (admitted, admissions) = self.admit(records);
        if admitted.is_empty() {
            return Ok(admissions);
        }

        let ids: Vec<String> = admitted.iter().map(|r| r.id.clone()).collect();
        if let Err(err) = self.scheduler.add(admitted) {
            // Never handed off, so the ids must stay admissible
            for id in &ids {
                self.deduper.forget(id);
            }
            return Err(err);
        }
        Ok(admissions)
    }

    /// Throttled path: admitted records wait in the backlog for the next drain.
    pub fn enqueue_throttled(
        &self,
        records: Vec<EventRecord>,
    ) -> Result<Vec<Admission>, PipelineError> {
        let admission = self.admission.read().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.lock();
        if !state.accepting {
            return Err(PipelineError::NotRunning);
        }
        let (admitted, admissions) = self.admit(records);
        let accepted = !admitted.is_empty();
        state.backlog.extend(admitted);
        drop(state);
        drop(admission);

        if accepted {
            self.schedule_drain();
        }
        Ok(admissions)
    }

    /// Arms the drain timer unless it is already armed or there is nothing to drain.
    /// The drain runs once the throttle window since the last drain has passed.
    pub fn schedule_drain(&self) {
        let mut state = self.lock();
        if state.timer != DrainTimer::Disarmed || state.backlog.is_empty() {
            return;
        }

        let now = Instant::now();
        let drain_at = match state.last_drain_at {
            Some(last) => (last + self.throttle).max(now),
            None => now,
        };
        state.timer = DrainTimer::Armed { drain_at };
        drop(state);
        self.drain_changed.notify_one();
    }

    fn admit(&self, records: Vec<EventRecord>) -> (Vec<EventRecord>, Vec<Admission>) {
        let mut admitted = Vec::with_capacity(records.len());
        let mut admissions = Vec::with_capacity(records.len());
        for record in records {
            if self.deduper.admit(&record.id) {
                admissions.push(Admission::Accepted);
                admitted.push(record);
            } else {
                debug!(id = %record.id, "dropping duplicate event");
                admissions.push(Admission::Duplicate);
            }
        }
        (admitted, admissions)
    }

    /// Pops up to `batchSize` records from the backlog and hands them to the
    /// scheduler, then re-arms if anything is left.
    fn drain_due(&self) {
        let _admission = self.admission.read().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.lock();
        let now = Instant::now();
        match state.timer {
            DrainTimer::Armed { drain_at } if drain_at <= now => {}
            _ => return,
        }
        state.timer = DrainTimer::Disarmed;

        let batch_size = self.config.get().batch_size.max(1);
        let take = batch_size.min(state.backlog.len());
        let batch: Vec<EventRecord> = state.backlog.drain(..take).collect();
        state.last_drain_at = Some(now);

        if !batch.is_empty() {
            report_drain(batch.len());
            debug!(batch_size = batch.len(), "draining throttled records");
            // Still under the drain lock, so drains reach the scheduler in order
            self.hand_to_scheduler(batch);
        }

        if !state.backlog.is_empty() {
            state.timer = DrainTimer::Armed {
                drain_at: now + self.throttle,
            };
        }
    }

    fn hand_to_scheduler(&self, batch: Vec<EventRecord>) {
        let size = batch.len();
        if let Err(err) = self.scheduler.add(batch) {
            error!(batch_size = size, "throttled records lost: {}", err);
        }
    }

    pub async fn run_drainer(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            match self.drain_timer() {
                DrainTimer::Disarmed => tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.drain_changed.notified() => {}
                },
                DrainTimer::Armed { drain_at } => tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.drain_changed.notified() => {}
                    _ = sleep_until(drain_at) => self.drain_due(),
                },
            }
        }
        debug!("drainer stopped");
    }

    pub(crate) fn open(&self) {
        self.lock().accepting = true;
    }

    /// Stops accepting throttled records and hands the whole backlog to the
    /// scheduler, which splits it into `batchSize` batches.
    pub(crate) fn close_and_drain(&self) -> usize {
        let _admission = self.admission.read().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.lock();
        state.accepting = false;
        state.timer = DrainTimer::Disarmed;
        let backlog: Vec<EventRecord> = state.backlog.drain(..).collect();
        let drained = backlog.len();
        if drained > 0 {
            info!(drained, "draining throttled backlog on shutdown");
            self.hand_to_scheduler(backlog);
        }
        drained
    }

    /// Hard reset of everything upstream of the store: drops the throttled backlog
    /// and the scheduler's pending records, queues a store clear behind the batches
    /// already handed to the committer, and forgets every seen id. Returns the
    /// dropped backlog and pending counts, and the clear's outcome when a committer
    /// is running.
    pub(crate) fn reset(&self) -> (usize, usize, Option<oneshot::Receiver<ClearOutcome>>) {
        let _admission = self.admission.write().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.lock();
        state.timer = DrainTimer::Disarmed;
        let backlog = state.backlog.len();
        state.backlog.clear();
        drop(state);

        let (pending, cleared) = self.scheduler.reset();
        self.deduper.forget_all();
        (backlog, pending, cleared)
    }

    fn lock(&self) -> MutexGuard<'_, DrainState> {
        self.drain.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
