//! Worker pool scheduler.
//!
//! One scheduler mutex serializes every dispatch decision; N executor
//! tasks run the jobs. Dispatch is event-driven: submissions, executor
//! completions, resumes, and subscription pokes each run the dispatch
//! loop until the scheduling precondition fails (paused, no free slot,
//! or an empty queue).
//!
//! Guarantees upheld here:
//!
//! - at most N jobs are in `Processing` at any instant, and the
//!   in-flight counter equals that cardinality
//! - queue-dictated dispatch order (FIFO, or priority with FIFO
//!   tie-break)
//! - closed jobs found at dispatch are discarded and release their wait
//!   tick
//! - purge never touches executing jobs
//! - close drains in-flight work and tears every executor down

pub(crate) mod wait_group;
pub mod worker;

pub use worker::WorkerKind;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{JobError, QueueError};
use crate::job::{JobCell, JobStatus};
use crate::queue::{AckQueue, Acknowledger, BaseQueue, ItemRepr, QueueItem};
use wait_group::WaitGroup;

/// Cadence of the drain polls in `wait_until_finished` and `close`.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Rehydrates a serialized snapshot into a live job cell. Installed only
/// by persistent facades, which own the serde bounds.
pub(crate) type Rehydrator<T, R> =
    Arc<dyn Fn(&[u8]) -> Result<Arc<JobCell<T, R>>, QueueError> + Send + Sync>;

/// Shared id-to-job index. The facade reads it for lookups; the pool
/// writes rehydrated jobs into it so outstanding handles observe their
/// results.
pub(crate) type JobIndex<T, R> = Arc<DashMap<String, Arc<JobCell<T, R>>>>;

/// The queue a pool drives, split by ack capability. This is the static
/// replacement for a runtime acknowledgeable-queue check.
pub(crate) enum PoolQueue<T, R> {
    Plain(Arc<dyn BaseQueue<T, R>>),
    Acknowledging(Arc<dyn AckQueue<T, R>>),
}

impl<T, R> PoolQueue<T, R> {
    fn dequeue_item(&self) -> Option<(QueueItem<T, R>, Option<String>)> {
        match self {
            PoolQueue::Plain(queue) => queue.dequeue().map(|item| (item, None)),
            PoolQueue::Acknowledging(queue) => queue
                .dequeue_with_ack_id()
                .map(|(item, ack_id)| (item, Some(ack_id))),
        }
    }

    fn len(&self) -> usize {
        match self {
            PoolQueue::Plain(queue) => queue.len(),
            PoolQueue::Acknowledging(queue) => queue.len(),
        }
    }

    fn values(&self) -> Vec<QueueItem<T, R>> {
        match self {
            PoolQueue::Plain(queue) => queue.values(),
            PoolQueue::Acknowledging(queue) => queue.values(),
        }
    }

    fn purge(&self) {
        match self {
            PoolQueue::Plain(queue) => queue.purge(),
            PoolQueue::Acknowledging(queue) => queue.purge(),
        }
    }

    fn close(&self) {
        match self {
            PoolQueue::Plain(queue) => queue.close(),
            PoolQueue::Acknowledging(queue) => queue.close(),
        }
    }
}

/// Slot stack and executor bookkeeping, all guarded by the scheduler
/// mutex.
struct DispatchState<T, R> {
    /// One sender per idle executor.
    slots: Vec<mpsc::UnboundedSender<Arc<JobCell<T, R>>>>,
    /// Join handles for the current executor generation.
    executors: Vec<JoinHandle<()>>,
    /// Shutdown signal for the current executor generation.
    shutdown: broadcast::Sender<()>,
}

pub(crate) struct PoolCore<T, R> {
    concurrency: usize,
    worker: WorkerKind<T, R>,
    queue: PoolQueue<T, R>,
    state: Mutex<DispatchState<T, R>>,
    /// Mutated only under the scheduler mutex, read lock-free.
    in_flight: AtomicUsize,
    paused: AtomicBool,
    stopped: AtomicBool,
    pending: WaitGroup,
    index: JobIndex<T, R>,
    rehydrate: Option<Rehydrator<T, R>>,
    acknowledger: Mutex<Option<Weak<dyn Acknowledger>>>,
}

impl<T, R> PoolCore<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn spawn_executors(self: &Arc<Self>, state: &mut DispatchState<T, R>) {
        for _ in 0..self.concurrency {
            let (slot, jobs) = mpsc::unbounded_channel();
            let shutdown = state.shutdown.subscribe();
            let core = Arc::clone(self);
            let executor_slot = slot.clone();
            state.executors.push(tokio::spawn(async move {
                executor_loop(core, jobs, executor_slot, shutdown).await;
            }));
            state.slots.push(slot);
        }
    }

    /// Runs the dispatch loop; call sites must hold the scheduler mutex.
    fn dispatch_locked(&self, state: &mut DispatchState<T, R>) {
        loop {
            if self.stopped.load(Ordering::SeqCst) || self.paused.load(Ordering::SeqCst) {
                return;
            }
            if self.in_flight.load(Ordering::SeqCst) >= self.concurrency {
                return;
            }
            let Some(slot) = state.slots.pop() else {
                return;
            };
            let Some((item, ack_id)) = self.queue.dequeue_item() else {
                state.slots.push(slot);
                return;
            };
            let cell = match item.0 {
                ItemRepr::Handle(cell) => cell,
                ItemRepr::Snapshot(bytes) => match self.rehydrate_snapshot(&bytes) {
                    Some(cell) => cell,
                    None => {
                        state.slots.push(slot);
                        continue;
                    }
                },
            };
            if !cell.begin_processing() {
                // Cancelled while queued: release the slot and the wait
                // tick, move on to the next candidate.
                state.slots.push(slot);
                self.pending.done();
                debug!(job_id = %cell.id(), "discarding closed job at dispatch");
                continue;
            }
            if let Some(ack_id) = ack_id {
                if !ack_id.is_empty() {
                    if let Some(acknowledger) = self.acknowledger.lock().unwrap().clone() {
                        cell.bind_ack(ack_id, acknowledger);
                    }
                }
            }
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            debug!(job_id = %cell.id(), in_flight = self.in_flight.load(Ordering::SeqCst), "job dispatched");
            if slot.send(cell).is_err() {
                // Only reachable when the executor generation was torn
                // down mid-dispatch; surrender the job with the pool.
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.pending.done();
                warn!("dropping job dispatched to a stopped executor");
                return;
            }
        }
    }

    /// Turns a dequeued snapshot into a runnable cell, reconciling it
    /// against the shared index so existing handles observe the result.
    fn rehydrate_snapshot(&self, bytes: &[u8]) -> Option<Arc<JobCell<T, R>>> {
        let Some(rehydrate) = &self.rehydrate else {
            warn!("dropping serialized item: queue has no rehydrator");
            return None;
        };
        match rehydrate(bytes) {
            Ok(cell) => {
                if cell.id().is_empty() {
                    // Cannot be reconciled; runs as-is with a fresh tick.
                    self.pending.add(1);
                    return Some(cell);
                }
                match self.index.entry(cell.id().to_string()) {
                    dashmap::mapref::entry::Entry::Occupied(existing) => {
                        Some(Arc::clone(existing.get()))
                    }
                    dashmap::mapref::entry::Entry::Vacant(vacant) => {
                        // First sight of a job persisted by another
                        // process: index it and give it a wait tick.
                        self.pending.add(1);
                        vacant.insert(Arc::clone(&cell));
                        Some(cell)
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "dropping snapshot that failed to rehydrate");
                None
            }
        }
    }

    /// Returns a freed slot to the stack and dispatches follow-up work.
    fn finish_job(&self, slot: &mpsc::UnboundedSender<Arc<JobCell<T, R>>>) {
        let mut state = self.state.lock().unwrap();
        if !self.stopped.load(Ordering::SeqCst) {
            state.slots.push(slot.clone());
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.pending.done();
        self.dispatch_locked(&mut state);
    }

    pub(crate) fn kick(&self) {
        let mut state = self.state.lock().unwrap();
        self.dispatch_locked(&mut state);
    }
}

async fn executor_loop<T, R>(
    core: Arc<PoolCore<T, R>>,
    mut jobs: mpsc::UnboundedReceiver<Arc<JobCell<T, R>>>,
    slot: mpsc::UnboundedSender<Arc<JobCell<T, R>>>,
    mut shutdown: broadcast::Receiver<()>,
) where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    loop {
        let cell = tokio::select! {
            _ = shutdown.recv() => break,
            cell = jobs.recv() => match cell {
                Some(cell) => cell,
                None => break,
            },
        };
        core.worker.execute(&cell).await;
        cell.set_status(JobStatus::Finished);
        cell.close_sink();
        match cell.try_ack() {
            Ok(()) | Err(JobError::NotAcknowledgeable(_)) => {}
            Err(err) => warn!(job_id = %cell.id(), error = %err, "acknowledge failed"),
        }
        core.finish_job(&slot);
    }
    debug!("executor stopped");
}

/// Fixed-size pool of worker slots bound to one queue.
///
/// Every pool is a freestanding value; independent pools coexist with
/// independent lifecycles.
pub(crate) struct WorkerPool<T, R> {
    core: Arc<PoolCore<T, R>>,
}

impl<T, R> Clone for WorkerPool<T, R> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T, R> WorkerPool<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Binds a pool to a queue and spawns its executors. Must run inside
    /// a tokio runtime.
    pub(crate) fn bind(
        config: &PoolConfig,
        worker: WorkerKind<T, R>,
        queue: PoolQueue<T, R>,
        index: JobIndex<T, R>,
        rehydrate: Option<Rehydrator<T, R>>,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        let (shutdown, _) = broadcast::channel(1);
        let core = Arc::new(PoolCore {
            concurrency,
            worker,
            queue,
            state: Mutex::new(DispatchState {
                slots: Vec::with_capacity(concurrency),
                executors: Vec::with_capacity(concurrency),
                shutdown,
            }),
            in_flight: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            pending: WaitGroup::new(),
            index,
            rehydrate,
            acknowledger: Mutex::new(None),
        });
        {
            let mut state = core.state.lock().unwrap();
            core.spawn_executors(&mut state);
        }
        info!(concurrency, "worker pool started");
        Self { core }
    }

    pub(crate) fn set_acknowledger(&self, acknowledger: Weak<dyn Acknowledger>) {
        *self.core.acknowledger.lock().unwrap() = Some(acknowledger);
    }

    pub(crate) fn downgrade_core(&self) -> Weak<PoolCore<T, R>> {
        Arc::downgrade(&self.core)
    }

    pub(crate) fn pending(&self) -> &WaitGroup {
        &self.core.pending
    }

    /// Whether submissions are still accepted.
    pub(crate) fn accepting(&self) -> bool {
        !self.core.stopped.load(Ordering::SeqCst)
    }

    /// Runs the dispatch loop once; called after submissions and pokes.
    pub(crate) fn kick(&self) {
        self.core.kick();
    }

    /// Stops dispatching new jobs. In-flight jobs run to completion.
    pub(crate) fn pause(&self) {
        self.core.paused.store(true, Ordering::SeqCst);
        debug!("worker pool paused");
    }

    /// Resumes dispatching and greedily fills the free slots.
    pub(crate) fn resume(&self) {
        self.core.paused.store(false, Ordering::SeqCst);
        debug!("worker pool resumed");
        self.kick();
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.core.paused.load(Ordering::SeqCst)
    }

    /// Number of jobs currently executing.
    pub(crate) fn current_processing(&self) -> usize {
        self.core.in_flight.load(Ordering::SeqCst)
    }

    /// Number of jobs waiting in the queue.
    pub(crate) fn pending_count(&self) -> usize {
        self.core.queue.len()
    }

    /// Removes every queued job, closing in-memory result channels and
    /// releasing wait ticks. Executing jobs are unaffected. Returns the
    /// ids of the purged jobs so the facade can clean its index.
    pub(crate) fn purge(&self) -> Vec<String> {
        let state = self.core.state.lock().unwrap();
        let removed = self.core.queue.values();
        self.core.queue.purge();

        let mut ids = Vec::new();
        for item in &removed {
            match &item.0 {
                ItemRepr::Handle(cell) => {
                    cell.close_sink();
                    cell.set_status(JobStatus::Closed);
                    if !cell.id().is_empty() {
                        ids.push(cell.id().to_string());
                    }
                }
                ItemRepr::Snapshot(bytes) => {
                    if let Some(rehydrate) = &self.core.rehydrate {
                        if let Ok(cell) = rehydrate(bytes) {
                            ids.push(cell.id().to_string());
                        }
                    }
                }
            }
        }
        self.core.pending.sub(removed.len());
        drop(state);

        debug!(purged = removed.len(), "purged pending jobs");
        ids
    }

    /// Pauses, drains in-flight work, recycles every executor and slot,
    /// and resumes. Used to recover a pool whose worker channels are
    /// suspect.
    pub(crate) async fn restart(&self) {
        if self.core.stopped.load(Ordering::SeqCst) {
            return;
        }
        info!("restarting worker pool");
        self.pause();
        self.wait_for_idle().await;

        let (old_executors, old_shutdown) = {
            let mut state = self.core.state.lock().unwrap();
            let executors = std::mem::take(&mut state.executors);
            state.slots.clear();
            let old_shutdown = state.shutdown.clone();
            let (shutdown, _) = broadcast::channel(1);
            state.shutdown = shutdown;
            self.core.spawn_executors(&mut state);
            (executors, old_shutdown)
        };
        let _ = old_shutdown.send(());
        for handle in old_executors {
            let _ = handle.await;
        }
        self.resume();
    }

    /// Waits for the wait group, then absorbs submission/completion races
    /// by polling until the queue is empty and nothing is executing.
    pub(crate) async fn wait_until_finished(&self) {
        self.core.pending.wait().await;
        while self.pending_count() > 0 || self.current_processing() > 0 {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Purges pending work, drains in-flight jobs, and tears the
    /// executors down. Idempotent.
    pub(crate) async fn close(&self) {
        if self.core.stopped.swap(true, Ordering::SeqCst) {
            debug!("worker pool already closed");
            return;
        }
        self.purge();
        self.wait_for_idle().await;

        let (executors, shutdown) = {
            let mut state = self.core.state.lock().unwrap();
            let executors = std::mem::take(&mut state.executors);
            state.slots.clear();
            (executors, state.shutdown.clone())
        };
        let _ = shutdown.send(());
        for handle in executors {
            if let Err(err) = handle.await {
                warn!(error = %err, "executor task failed during shutdown");
            }
        }
        self.core.queue.close();
        info!("worker pool closed");
    }

    async fn wait_for_idle(&self) {
        while self.current_processing() > 0 {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::queue::{FifoQueue, RingQueue};
    use std::sync::atomic::AtomicUsize;

    fn counting_worker(counter: Arc<AtomicUsize>) -> WorkerKind<u32, u32> {
        WorkerKind::returning(move |x: u32| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<u32, WorkerError>(x)
            }
        })
    }

    fn bind_pool(
        concurrency: usize,
        worker: WorkerKind<u32, u32>,
    ) -> (WorkerPool<u32, u32>, Arc<RingQueue<u32, u32>>) {
        let queue = Arc::new(RingQueue::new());
        let plain: Arc<dyn BaseQueue<u32, u32>> = Arc::clone(&queue) as Arc<dyn BaseQueue<u32, u32>>;
        let pool = WorkerPool::bind(
            &PoolConfig::new(concurrency),
            worker,
            PoolQueue::Plain(plain),
            Arc::new(DashMap::new()),
            None,
        );
        (pool, queue)
    }

    fn submit(pool: &WorkerPool<u32, u32>, queue: &RingQueue<u32, u32>, value: u32) {
        let cell = JobCell::new(format!("job-{value}"), value);
        pool.pending().add(1);
        cell.set_status(JobStatus::Queued);
        assert!(queue.enqueue(QueueItem::handle(cell)));
        pool.kick();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pool_processes_submissions() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (pool, queue) = bind_pool(2, counting_worker(Arc::clone(&counter)));

        for value in 0..8 {
            submit(&pool, &queue, value);
        }
        pool.wait_until_finished().await;

        assert_eq!(counter.load(Ordering::SeqCst), 8);
        assert_eq!(pool.current_processing(), 0);
        pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart_recycles_executors_and_keeps_working() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (pool, queue) = bind_pool(2, counting_worker(Arc::clone(&counter)));

        for value in 0..3 {
            submit(&pool, &queue, value);
        }
        pool.restart().await;
        assert!(!pool.is_paused());

        for value in 3..6 {
            submit(&pool, &queue, value);
        }
        pool.wait_until_finished().await;
        assert_eq!(counter.load(Ordering::SeqCst), 6);

        pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_closed_job_discarded_at_dispatch_releases_tick() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (pool, queue) = bind_pool(1, counting_worker(Arc::clone(&counter)));

        pool.pause();
        let cell = JobCell::new("victim".to_string(), 1);
        pool.pending().add(1);
        cell.set_status(JobStatus::Queued);
        assert!(queue.enqueue(QueueItem::handle(Arc::clone(&cell))));
        cell.close().unwrap();
        pool.resume();

        // The discarded job must release its wait tick or this hangs.
        pool.wait_until_finished().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_snapshot_without_rehydrator_is_dropped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (pool, queue) = bind_pool(1, counting_worker(Arc::clone(&counter)));

        assert!(queue.enqueue(QueueItem::snapshot(b"{}".to_vec())));
        pool.kick();
        pool.wait_until_finished().await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(pool.pending_count(), 0);
        pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_is_idempotent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (pool, queue) = bind_pool(1, counting_worker(Arc::clone(&counter)));

        submit(&pool, &queue, 1);
        pool.wait_until_finished().await;
        pool.close().await;
        pool.close().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
