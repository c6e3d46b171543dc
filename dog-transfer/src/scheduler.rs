//! Bounded worker pool over a shared operation queue.
//!
//! Each transfer contributes one operation per chunk plus a finalize
//! operation. Finalize depends on every chunk operation of its transfer: it
//! is enqueued only once the transfer's outstanding set is empty, so it never
//! holds a worker while waiting.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::ChunkError;
use crate::types::TransferId;

/// How a chunk operation settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Complete,
    Failed(String),
    Canceled,
}

/// Executes the operations the scheduler dequeues
#[async_trait]
pub(crate) trait OperationRunner: Send + Sync {
    /// Run one attempt of a chunk; returns the bytes moved
    async fn run_chunk(&self, id: &TransferId, index: u32, attempt: u32) -> Result<u64, ChunkError>;

    /// A retryable failure was re-queued
    async fn chunk_retrying(&self, id: &TransferId, index: u32, attempt: u32, error: &ChunkError);

    /// The chunk failed for good
    async fn chunk_failed(&self, id: &TransferId, index: u32, error: &ChunkError);

    /// Every chunk operation of the transfer has settled
    async fn run_finalize(&self, id: &TransferId, outcomes: BTreeMap<u32, ChunkOutcome>);
}

/// Exponential backoff with jitter between chunk attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn should_retry(&self, attempt: u32, error: &ChunkError) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    /// Delay before attempt `attempt + 1`: `base * 2^(attempt-1)` capped at `max`,
    /// scaled by a random factor in `[0.5, 1.0]`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let backoff = self.base.saturating_mul(1u32 << exp).min(self.max);
        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        backoff.mul_f64(factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Chunk { index: u32, attempt: u32 },
    Finalize,
}

#[derive(Debug)]
struct QueueEntry {
    transfer: TransferId,
    op: Operation,
    not_before: Option<Instant>,
}

#[derive(Debug, Default)]
struct TransferSlot {
    outstanding: BTreeSet<u32>,
    outcomes: BTreeMap<u32, ChunkOutcome>,
    paused: bool,
    canceled: bool,
    finalize_queued: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<QueueEntry>,
    transfers: HashMap<TransferId, TransferSlot>,
    running: usize,
    shutdown: bool,
}

impl QueueState {
    /// Enqueue finalize once nothing is outstanding
    fn maybe_finalize(&mut self, id: &TransferId) {
        if let Some(slot) = self.transfers.get_mut(id) {
            if slot.outstanding.is_empty() && !slot.finalize_queued {
                slot.finalize_queued = true;
                self.ready.push_back(QueueEntry {
                    transfer: id.clone(),
                    op: Operation::Finalize,
                    not_before: None,
                });
            }
        }
    }

    fn settle(&mut self, id: &TransferId, index: u32, outcome: ChunkOutcome) {
        if let Some(slot) = self.transfers.get_mut(id) {
            slot.outstanding.remove(&index);
            slot.outcomes.insert(index, outcome);
        }
        self.maybe_finalize(id);
    }
}

enum Next {
    Run(QueueEntry),
    Wait(Option<Instant>),
    Shutdown,
}

enum Settlement {
    Complete,
    Retry { delay: Duration },
    Fail,
    Canceled,
}

pub(crate) struct Scheduler {
    state: Mutex<QueueState>,
    notify: Notify,
    policy: RetryPolicy,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            policy,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `count` workers (at least one)
    pub(crate) fn start(self: &Arc<Self>, runtime: &Handle, runner: Weak<dyn OperationRunner>, count: usize) {
        let mut workers = self.workers.lock();
        for worker in 0..count.max(1) {
            let scheduler = self.clone();
            let runner = runner.clone();
            workers.push(runtime.spawn(async move {
                scheduler.worker_loop(worker, runner).await;
            }));
        }
        info!(workers = workers.len(), "transfer workers started");
    }

    /// Add chunk operations for a transfer. Each pair is `(index, attempts already spent)`.
    ///
    /// `paused` only applies when the transfer is new to the scheduler. Chunks
    /// already outstanding are skipped, chunks added to a canceled transfer
    /// settle as canceled immediately, and a transfer with nothing to run goes
    /// straight to finalize.
    pub(crate) fn schedule(&self, id: &TransferId, chunks: Vec<(u32, u32)>, paused: bool) {
        {
            let mut state = self.state.lock();
            let slot = state
                .transfers
                .entry(id.clone())
                .or_insert_with(|| TransferSlot {
                    paused,
                    ..Default::default()
                });

            let mut entries = Vec::with_capacity(chunks.len());
            for (index, spent) in chunks {
                if slot.canceled {
                    slot.outcomes.insert(index, ChunkOutcome::Canceled);
                    continue;
                }
                // Already queued or running
                if !slot.outstanding.insert(index) {
                    continue;
                }
                slot.outcomes.remove(&index);
                entries.push(QueueEntry {
                    transfer: id.clone(),
                    op: Operation::Chunk {
                        index,
                        attempt: spent + 1,
                    },
                    not_before: None,
                });
            }

            state.ready.extend(entries);
            state.maybe_finalize(id);
        }
        self.notify.notify_waiters();
    }

    /// Clear the canceled flag before an explicit retry
    pub(crate) fn reopen(&self, id: &TransferId, paused: bool) {
        let mut state = self.state.lock();
        let slot = state.transfers.entry(id.clone()).or_default();
        slot.canceled = false;
        slot.paused = paused;
    }

    /// Queued chunk operations of a paused transfer are skipped
    pub(crate) fn pause(&self, id: &TransferId) {
        if let Some(slot) = self.state.lock().transfers.get_mut(id) {
            slot.paused = true;
        }
    }

    pub(crate) fn resume(&self, id: &TransferId) {
        if let Some(slot) = self.state.lock().transfers.get_mut(id) {
            slot.paused = false;
        }
        self.notify.notify_waiters();
    }

    /// Drop queued chunk operations and settle them as canceled.
    /// Returns the indices that were removed from the queue.
    pub(crate) fn cancel(&self, id: &TransferId) -> Vec<u32> {
        let removed = {
            let mut state = self.state.lock();
            let state = &mut *state;
            state.transfers.entry(id.clone()).or_default().canceled = true;

            let mut removed = Vec::new();
            state.ready.retain(|entry| match entry.op {
                Operation::Chunk { index, .. } if &entry.transfer == id => {
                    removed.push(index);
                    false
                }
                _ => true,
            });

            for index in &removed {
                state.settle(id, *index, ChunkOutcome::Canceled);
            }
            state.maybe_finalize(id);
            removed
        };
        self.notify.notify_waiters();
        removed
    }

    /// Forget a removed transfer and anything still queued for it
    pub(crate) fn forget(&self, id: &TransferId) {
        let mut state = self.state.lock();
        state.transfers.remove(id);
        state.ready.retain(|entry| &entry.transfer != id);
    }

    /// Operations currently executing on workers
    pub(crate) fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Stop dequeuing and wait for workers to finish their current operation
    pub(crate) async fn shutdown(&self) {
        self.signal_shutdown();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!("transfer worker join error: {}", e);
            }
        }
    }

    pub(crate) fn signal_shutdown(&self) {
        self.state.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    fn next_entry(&self) -> Next {
        let mut state = self.state.lock();
        if state.shutdown {
            return Next::Shutdown;
        }

        let now = Instant::now();
        let mut earliest: Option<Instant> = None;
        let mut found = None;

        for (position, entry) in state.ready.iter().enumerate() {
            let Some(slot) = state.transfers.get(&entry.transfer) else {
                continue;
            };
            if matches!(entry.op, Operation::Chunk { .. }) && slot.paused {
                continue;
            }
            if let Some(not_before) = entry.not_before {
                if not_before > now {
                    earliest = Some(earliest.map_or(not_before, |e| e.min(not_before)));
                    continue;
                }
            }
            found = Some(position);
            break;
        }

        match found.and_then(|position| state.ready.remove(position)) {
            Some(entry) => {
                if entry.op == Operation::Finalize {
                    if let Some(slot) = state.transfers.get_mut(&entry.transfer) {
                        slot.finalize_queued = false;
                    }
                }
                state.running += 1;
                Next::Run(entry)
            }
            None => Next::Wait(earliest),
        }
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, runner: Weak<dyn OperationRunner>) {
        debug!(worker, "transfer worker started");

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.next_entry() {
                Next::Run(entry) => {
                    let Some(runner) = runner.upgrade() else {
                        self.state.lock().running -= 1;
                        break;
                    };
                    self.execute(runner.as_ref(), entry).await;
                }
                Next::Wait(Some(deadline)) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                Next::Wait(None) => notified.await,
                Next::Shutdown => break,
            }
        }

        debug!(worker, "transfer worker stopped");
    }

    async fn execute(&self, runner: &dyn OperationRunner, entry: QueueEntry) {
        let id = entry.transfer;

        match entry.op {
            Operation::Finalize => {
                let outcomes = self
                    .state
                    .lock()
                    .transfers
                    .get(&id)
                    .map(|slot| slot.outcomes.clone())
                    .unwrap_or_default();

                runner.run_finalize(&id, outcomes).await;
                self.state.lock().running -= 1;
            }
            Operation::Chunk { index, attempt } => {
                let result = runner.run_chunk(&id, index, attempt).await;

                let settlement = {
                    let state = self.state.lock();
                    let canceled = state.transfers.get(&id).map_or(true, |slot| slot.canceled);
                    match &result {
                        Ok(_) => Settlement::Complete,
                        Err(_) if canceled => Settlement::Canceled,
                        Err(e) if self.policy.should_retry(attempt, e) => Settlement::Retry {
                            delay: self.policy.delay(attempt),
                        },
                        Err(_) => Settlement::Fail,
                    }
                };

                // Record-keeping callbacks run before the chunk leaves the
                // outstanding set, so finalize always sees the settled chunk.
                match (&settlement, &result) {
                    (Settlement::Retry { delay }, Err(e)) => {
                        warn!(transfer = %id, chunk = index, attempt, ?delay, "chunk failed, will retry: {}", e);
                        runner.chunk_retrying(&id, index, attempt, e).await;
                    }
                    (Settlement::Fail, Err(e)) => {
                        error!(transfer = %id, chunk = index, attempt, "chunk failed permanently: {}", e);
                        runner.chunk_failed(&id, index, e).await;
                    }
                    _ => {}
                }

                {
                    let mut state = self.state.lock();
                    state.running -= 1;
                    match settlement {
                        Settlement::Complete => state.settle(&id, index, ChunkOutcome::Complete),
                        Settlement::Canceled => state.settle(&id, index, ChunkOutcome::Canceled),
                        Settlement::Fail => {
                            let message = result.err().map(|e| e.to_string()).unwrap_or_default();
                            state.settle(&id, index, ChunkOutcome::Failed(message));
                        }
                        Settlement::Retry { delay } => {
                            let canceled = state.transfers.get(&id).map_or(true, |slot| slot.canceled);
                            if canceled {
                                state.settle(&id, index, ChunkOutcome::Canceled);
                            } else {
                                state.ready.push_back(QueueEntry {
                                    transfer: id.clone(),
                                    op: Operation::Chunk {
                                        index,
                                        attempt: attempt + 1,
                                    },
                                    not_before: Some(Instant::now() + delay),
                                });
                            }
                        }
                    }
                }
            }
        }

        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        fail_first: Mutex<HashMap<u32, u32>>,
        permanent: BTreeSet<u32>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        runs: Mutex<Vec<(u32, u32)>>,
        retrying: Mutex<Vec<(u32, u32)>>,
        failed: Mutex<Vec<u32>>,
        finalized: Mutex<Vec<BTreeMap<u32, ChunkOutcome>>>,
        done: Notify,
    }

    #[async_trait]
    impl OperationRunner for Recorder {
        async fn run_chunk(&self, _id: &TransferId, index: u32, attempt: u32) -> Result<u64, ChunkError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.runs.lock().push((index, attempt));
            if self.permanent.contains(&index) {
                return Err(ChunkError::permanent("denied"));
            }
            let mut fail_first = self.fail_first.lock();
            if let Some(remaining) = fail_first.get_mut(&index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ChunkError::transient("reset"));
                }
            }
            Ok(1)
        }

        async fn chunk_retrying(&self, _id: &TransferId, index: u32, attempt: u32, _error: &ChunkError) {
            self.retrying.lock().push((index, attempt));
        }

        async fn chunk_failed(&self, _id: &TransferId, index: u32, _error: &ChunkError) {
            self.failed.lock().push(index);
        }

        async fn run_finalize(&self, _id: &TransferId, outcomes: BTreeMap<u32, ChunkOutcome>) {
            self.finalized.lock().push(outcomes);
            self.done.notify_waiters();
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
        }
    }

    async fn run_to_finalize(
        recorder: Arc<Recorder>,
        policy: RetryPolicy,
        workers: usize,
        chunks: u32,
    ) -> Arc<Scheduler> {
        let scheduler = Arc::new(Scheduler::new(policy));
        let runner: Arc<dyn OperationRunner> = recorder.clone();
        scheduler.start(&Handle::current(), Arc::downgrade(&runner), workers);

        let done = recorder.done.notified();
        tokio::pin!(done);
        done.as_mut().enable();

        let id = TransferId::new();
        scheduler.schedule(&id, (0..chunks).map(|index| (index, 0)).collect(), false);
        tokio::time::timeout(Duration::from_secs(5), done).await.unwrap();

        drop(runner);
        scheduler
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_worker_count() {
        let recorder = Arc::new(Recorder::default());
        let scheduler = run_to_finalize(recorder.clone(), policy(3), 2, 8).await;

        assert!(recorder.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(recorder.runs.lock().len(), 8);
        let outcomes = &recorder.finalized.lock()[0];
        assert_eq!(outcomes.len(), 8);
        assert!(outcomes.values().all(|o| *o == ChunkOutcome::Complete));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_with_next_attempt() {
        let recorder = Arc::new(Recorder::default());
        recorder.fail_first.lock().insert(1, 1);
        let scheduler = run_to_finalize(recorder.clone(), policy(3), 2, 3).await;

        assert_eq!(*recorder.retrying.lock(), vec![(1, 1)]);
        assert!(recorder.runs.lock().contains(&(1, 2)));
        assert!(recorder.failed.lock().is_empty());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_fails_chunk() {
        let recorder = Arc::new(Recorder::default());
        recorder.fail_first.lock().insert(0, 10);
        let scheduler = run_to_finalize(recorder.clone(), policy(3), 1, 2).await;

        assert_eq!(*recorder.retrying.lock(), vec![(0, 1), (0, 2)]);
        assert_eq!(*recorder.failed.lock(), vec![0]);
        let outcomes = &recorder.finalized.lock()[0];
        assert!(matches!(outcomes.get(&0), Some(ChunkOutcome::Failed(_))));
        assert_eq!(outcomes.get(&1), Some(&ChunkOutcome::Complete));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let recorder = Arc::new(Recorder {
            permanent: BTreeSet::from([0]),
            ..Default::default()
        });
        let scheduler = run_to_finalize(recorder.clone(), policy(3), 1, 1).await;

        assert!(recorder.retrying.lock().is_empty());
        assert_eq!(*recorder.runs.lock(), vec![(0, 1)]);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_schedule_finalizes_immediately() {
        let recorder = Arc::new(Recorder::default());
        let scheduler = run_to_finalize(recorder.clone(), policy(3), 1, 0).await;

        assert!(recorder.runs.lock().is_empty());
        assert_eq!(recorder.finalized.lock().len(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_settles_queued_chunks() {
        let recorder = Arc::new(Recorder::default());
        let scheduler = Arc::new(Scheduler::new(policy(3)));
        let id = TransferId::new();

        // Paused: nothing is dequeued before the cancel
        scheduler.schedule(&id, vec![(0, 0), (1, 0), (2, 0)], true);
        let removed = scheduler.cancel(&id);
        assert_eq!(removed, vec![0, 1, 2]);

        let runner: Arc<dyn OperationRunner> = recorder.clone();
        let done = recorder.done.notified();
        tokio::pin!(done);
        done.as_mut().enable();
        scheduler.start(&Handle::current(), Arc::downgrade(&runner), 1);
        tokio::time::timeout(Duration::from_secs(5), done).await.unwrap();

        assert!(recorder.runs.lock().is_empty());
        let outcomes = &recorder.finalized.lock()[0];
        assert!(outcomes.values().all(|o| *o == ChunkOutcome::Canceled));
        scheduler.shutdown().await;
    }

    #[test]
    fn test_backoff_is_capped_and_jittered() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
        };

        let first = policy.delay(1);
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));
        let capped = policy.delay(8);
        assert!(capped >= Duration::from_millis(175) && capped <= Duration::from_millis(350));
    }
}
