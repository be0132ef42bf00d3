//! User-facing queues binding a worker pool to a concrete queue.
//!
//! Each facade wraps a scheduler plus one queue flavor:
//!
//! - `JobQueue`: in-memory FIFO
//! - `PriorityJobQueue`: in-memory priority queue
//! - `PersistentJobQueue`: acknowledging byte back-end, with optional
//!   subscription wiring for back-ends that report external enqueues
//! - `DistributedProducer`: submit-only producer over a shared back-end
//!
//! Submissions return `JobHandle`s; batches return a `GroupJob` whose
//! children share one fan-in result stream. Jobs with ids are tracked in
//! a concurrent index for `job_by_id` lookups.

use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{JobOptions, PoolConfig};
use crate::error::QueueError;
use crate::job::{GroupJob, JobCell, JobHandle, JobStatus};
use crate::pool::{JobIndex, PoolQueue, Rehydrator, WorkerKind, WorkerPool};
use crate::queue::{
    AckQueue, Acknowledger, BaseQueue, FifoQueue, HeapQueue, PersistentAdapter, PersistentBackend,
    PriorityQueue, QueueItem, RingQueue, SubscribableBackend,
};

/// Prefix applied to group job ids.
const GROUP_ID_PREFIX: &str = "group:";

/// Normalizes a raw id into its group form.
fn group_key(raw: &str) -> String {
    if raw.starts_with(GROUP_ID_PREFIX) {
        raw.to_string()
    } else {
        format!("{GROUP_ID_PREFIX}{raw}")
    }
}

/// An identified payload for persistent batch submission.
#[derive(Debug, Clone)]
pub struct Item<T> {
    pub id: String,
    pub value: T,
}

impl<T> Item<T> {
    pub fn new(id: impl Into<String>, value: T) -> Self {
        Self {
            id: id.into(),
            value,
        }
    }
}

/// State shared by every facade flavor.
struct FacadeCore<T, R> {
    pool: WorkerPool<T, R>,
    index: JobIndex<T, R>,
    groups: DashMap<String, GroupJob<R>>,
}

impl<T, R> FacadeCore<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn new(pool: WorkerPool<T, R>, index: JobIndex<T, R>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            index,
            groups: DashMap::new(),
        })
    }

    fn register(&self, cell: &Arc<JobCell<T, R>>) {
        if !cell.id().is_empty() {
            self.index.insert(cell.id().to_string(), Arc::clone(cell));
        }
    }

    fn unregister(&self, id: &str) {
        if !id.is_empty() {
            self.index.remove(id);
        }
    }

    fn job_by_id(&self, id: &str) -> Result<JobHandle<T, R>, QueueError> {
        self.index
            .get(id)
            .map(|cell| JobHandle::new(Arc::clone(cell.value())))
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))
    }

    fn groups_job_by_id(&self, id: &str) -> Result<GroupJob<R>, QueueError> {
        let key = group_key(id);
        self.groups
            .get(&key)
            .map(|group| group.clone())
            .ok_or(QueueError::GroupJobNotFound(key))
    }

    async fn wait_until_finished(&self) {
        // Waiting while paused would deadlock; resume first.
        if self.pool.is_paused() {
            self.pool.resume();
        }
        self.pool.wait_until_finished().await;
    }

    fn purge(&self) {
        for id in self.pool.purge() {
            if let Some((_, cell)) = self.index.remove(&id) {
                cell.close_sink();
                cell.set_status(JobStatus::Closed);
            }
        }
    }

    async fn restart(&self) {
        self.pool.restart().await;
    }

    async fn close(&self) {
        self.pool.close().await;
        self.index.clear();
        self.groups.clear();
    }

    async fn wait_and_close(&self) {
        self.wait_until_finished().await;
        self.close().await;
    }
}

/// FIFO queue facade: submissions are dispatched in arrival order to a
/// fixed pool of workers.
pub struct JobQueue<T, R> {
    core: Arc<FacadeCore<T, R>>,
    queue: Arc<RingQueue<T, R>>,
}

impl<T, R> Clone for JobQueue<T, R> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<T, R> JobQueue<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Creates a FIFO queue driving `worker` with the configured
    /// concurrency. Must be called within a tokio runtime.
    pub fn new(config: PoolConfig, worker: WorkerKind<T, R>) -> Self {
        let queue = Arc::new(RingQueue::new());
        let index: JobIndex<T, R> = Arc::new(DashMap::new());
        let plain: Arc<dyn BaseQueue<T, R>> = Arc::clone(&queue) as Arc<dyn BaseQueue<T, R>>;
        let pool = WorkerPool::bind(
            &config,
            worker,
            PoolQueue::Plain(plain),
            Arc::clone(&index),
            None,
        );
        Self {
            core: FacadeCore::new(pool, index),
            queue,
        }
    }

    /// Submits one payload with an auto-generated id.
    pub fn add(&self, data: T) -> Result<JobHandle<T, R>, QueueError> {
        self.add_with(data, JobOptions::new())
    }

    /// Submits one payload with explicit options.
    ///
    /// # Errors
    ///
    /// `EnqueueRejected` when the queue is closed or signals
    /// back-pressure; the prepared job is closed in that case.
    pub fn add_with(&self, data: T, options: JobOptions) -> Result<JobHandle<T, R>, QueueError> {
        if !self.core.pool.accepting() {
            return Err(QueueError::EnqueueRejected);
        }
        let id = options
            .id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cell = JobCell::new(id, data);
        self.core.pool.pending().add(1);
        self.core.register(&cell);
        cell.set_status(JobStatus::Queued);
        if !self.queue.enqueue(QueueItem::handle(Arc::clone(&cell))) {
            self.core.unregister(cell.id());
            self.core.pool.pending().done();
            let _ = cell.close();
            return Err(QueueError::EnqueueRejected);
        }
        debug!(job_id = %cell.id(), "job enqueued");
        self.core.pool.kick();
        Ok(JobHandle::new(cell))
    }

    /// Submits a batch as a group job sharing one result stream.
    ///
    /// Enqueue failures are per item: a rejected child is closed and the
    /// rest of the batch proceeds.
    pub fn add_all(&self, items: Vec<T>) -> GroupJob<R> {
        let group = GroupJob::new(group_key(&Uuid::new_v4().to_string()), items.len());
        for data in items {
            let cell = JobCell::grouped(String::new(), data, group.stream());
            self.core.pool.pending().add(1);
            cell.set_status(JobStatus::Queued);
            if !self.queue.enqueue(QueueItem::handle(Arc::clone(&cell))) {
                self.core.pool.pending().done();
                let _ = cell.close();
                warn!(group_id = %group.id(), "dropping job rejected by the queue");
            }
        }
        self.core.pool.kick();
        self.core
            .groups
            .insert(group.id().to_string(), group.clone());
        group
    }

    /// Looks up a job by its id.
    pub fn job_by_id(&self, id: &str) -> Result<JobHandle<T, R>, QueueError> {
        self.core.job_by_id(id)
    }

    /// Looks up a group job, accepting either the raw or the
    /// group-prefixed id.
    pub fn groups_job_by_id(&self, id: &str) -> Result<GroupJob<R>, QueueError> {
        self.core.groups_job_by_id(id)
    }

    /// Number of jobs waiting in the queue.
    pub fn pending_count(&self) -> usize {
        self.core.pool.pending_count()
    }

    /// Number of jobs currently executing.
    pub fn processing_count(&self) -> usize {
        self.core.pool.current_processing()
    }

    /// Stops dispatching; in-flight jobs run to completion.
    pub fn pause(&self) {
        self.core.pool.pause();
    }

    /// Resumes dispatching and fills the free worker slots.
    pub fn resume(&self) {
        self.core.pool.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.core.pool.is_paused()
    }

    /// Waits until every submitted job has been processed. Resumes the
    /// pool first when paused, since waiting while paused could never
    /// return.
    pub async fn wait_until_finished(&self) {
        self.core.wait_until_finished().await;
    }

    /// Pauses, drains in-flight work, recycles every worker slot, and
    /// resumes. Pending jobs are untouched and dispatch afterwards.
    pub async fn restart(&self) {
        self.core.restart().await;
    }

    /// Cancels every queued job. Executing jobs are unaffected and still
    /// deliver their results.
    pub fn purge(&self) {
        self.core.purge();
    }

    /// Purges pending work, drains in-flight jobs, and releases the
    /// workers. Idempotent.
    pub async fn close(&self) {
        self.core.close().await;
    }

    /// Waits for every submitted job to finish, then closes.
    pub async fn wait_and_close(&self) {
        self.core.wait_and_close().await;
    }
}

/// Priority queue facade: smallest priority dispatches first, ties break
/// in submission order.
pub struct PriorityJobQueue<T, R> {
    core: Arc<FacadeCore<T, R>>,
    queue: Arc<HeapQueue<T, R>>,
}

impl<T, R> Clone for PriorityJobQueue<T, R> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<T, R> PriorityJobQueue<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Creates a priority queue driving `worker` with the configured
    /// concurrency. Must be called within a tokio runtime.
    pub fn new(config: PoolConfig, worker: WorkerKind<T, R>) -> Self {
        let queue = Arc::new(HeapQueue::new());
        let index: JobIndex<T, R> = Arc::new(DashMap::new());
        let plain: Arc<dyn BaseQueue<T, R>> = Arc::clone(&queue) as Arc<dyn BaseQueue<T, R>>;
        let pool = WorkerPool::bind(
            &config,
            worker,
            PoolQueue::Plain(plain),
            Arc::clone(&index),
            None,
        );
        Self {
            core: FacadeCore::new(pool, index),
            queue,
        }
    }

    /// Submits one payload at the given priority.
    pub fn add(&self, data: T, priority: i64) -> Result<JobHandle<T, R>, QueueError> {
        self.add_with(data, priority, JobOptions::new())
    }

    /// Submits one payload at the given priority with explicit options.
    pub fn add_with(
        &self,
        data: T,
        priority: i64,
        options: JobOptions,
    ) -> Result<JobHandle<T, R>, QueueError> {
        if !self.core.pool.accepting() {
            return Err(QueueError::EnqueueRejected);
        }
        let id = options
            .id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cell = JobCell::new(id, data);
        self.core.pool.pending().add(1);
        self.core.register(&cell);
        cell.set_status(JobStatus::Queued);
        if !self
            .queue
            .enqueue(QueueItem::handle(Arc::clone(&cell)), priority)
        {
            self.core.unregister(cell.id());
            self.core.pool.pending().done();
            let _ = cell.close();
            return Err(QueueError::EnqueueRejected);
        }
        debug!(job_id = %cell.id(), priority, "job enqueued");
        self.core.pool.kick();
        Ok(JobHandle::new(cell))
    }

    /// Submits a batch of `(payload, priority)` pairs as a group job.
    pub fn add_all(&self, items: Vec<(T, i64)>) -> GroupJob<R> {
        let group = GroupJob::new(group_key(&Uuid::new_v4().to_string()), items.len());
        for (data, priority) in items {
            let cell = JobCell::grouped(String::new(), data, group.stream());
            self.core.pool.pending().add(1);
            cell.set_status(JobStatus::Queued);
            if !self
                .queue
                .enqueue(QueueItem::handle(Arc::clone(&cell)), priority)
            {
                self.core.pool.pending().done();
                let _ = cell.close();
                warn!(group_id = %group.id(), "dropping job rejected by the queue");
            }
        }
        self.core.pool.kick();
        self.core
            .groups
            .insert(group.id().to_string(), group.clone());
        group
    }

    /// Looks up a job by its id.
    pub fn job_by_id(&self, id: &str) -> Result<JobHandle<T, R>, QueueError> {
        self.core.job_by_id(id)
    }

    /// Looks up a group job, accepting either the raw or the
    /// group-prefixed id.
    pub fn groups_job_by_id(&self, id: &str) -> Result<GroupJob<R>, QueueError> {
        self.core.groups_job_by_id(id)
    }

    /// Number of jobs waiting in the queue.
    pub fn pending_count(&self) -> usize {
        self.core.pool.pending_count()
    }

    /// Number of jobs currently executing.
    pub fn processing_count(&self) -> usize {
        self.core.pool.current_processing()
    }

    /// Stops dispatching; in-flight jobs run to completion.
    pub fn pause(&self) {
        self.core.pool.pause();
    }

    /// Resumes dispatching and fills the free worker slots.
    pub fn resume(&self) {
        self.core.pool.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.core.pool.is_paused()
    }

    /// Waits until every submitted job has been processed. Resumes the
    /// pool first when paused, since waiting while paused could never
    /// return.
    pub async fn wait_until_finished(&self) {
        self.core.wait_until_finished().await;
    }

    /// Pauses, drains in-flight work, recycles every worker slot, and
    /// resumes. Pending jobs are untouched and dispatch afterwards.
    pub async fn restart(&self) {
        self.core.restart().await;
    }

    /// Cancels every queued job. Executing jobs are unaffected and still
    /// deliver their results.
    pub fn purge(&self) {
        self.core.purge();
    }

    /// Purges pending work, drains in-flight jobs, and releases the
    /// workers. Idempotent.
    pub async fn close(&self) {
        self.core.close().await;
    }

    /// Waits for every submitted job to finish, then closes.
    pub async fn wait_and_close(&self) {
        self.core.wait_and_close().await;
    }
}

/// Facade over an acknowledging byte back-end. Jobs must carry stable
/// ids; submissions are serialized snapshots and survive process
/// restarts.
pub struct PersistentJobQueue<T, R, B> {
    core: Arc<FacadeCore<T, R>>,
    adapter: Arc<PersistentAdapter<T, R, B>>,
}

impl<T, R, B> Clone for PersistentJobQueue<T, R, B> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            adapter: Arc::clone(&self.adapter),
        }
    }
}

impl<T, R, B> PersistentJobQueue<T, R, B>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    B: PersistentBackend + 'static,
{
    /// Binds a worker pool to a persistent back-end and picks up any
    /// work already sitting in it. Must be called within a tokio
    /// runtime.
    pub fn new(config: PoolConfig, worker: WorkerKind<T, R>, backend: Arc<B>) -> Self {
        let adapter = Arc::new(PersistentAdapter::new(backend));
        let index: JobIndex<T, R> = Arc::new(DashMap::new());
        let rehydrate: Rehydrator<T, R> = Arc::new(|bytes| JobCell::from_snapshot_bytes(bytes));
        let acknowledging: Arc<dyn AckQueue<T, R>> =
            Arc::clone(&adapter) as Arc<dyn AckQueue<T, R>>;
        let pool = WorkerPool::bind(
            &config,
            worker,
            PoolQueue::Acknowledging(acknowledging),
            Arc::clone(&index),
            Some(rehydrate),
        );
        let acknowledger: Arc<dyn Acknowledger> = Arc::clone(&adapter) as Arc<dyn Acknowledger>;
        pool.set_acknowledger(Arc::downgrade(&acknowledger));
        // Recover work persisted before this process started.
        pool.kick();
        Self {
            core: FacadeCore::new(pool, index),
            adapter,
        }
    }

    /// Same as `new`, additionally poking the scheduler whenever the
    /// back-end reports externally enqueued items.
    pub fn with_subscription(config: PoolConfig, worker: WorkerKind<T, R>, backend: Arc<B>) -> Self
    where
        B: SubscribableBackend,
    {
        let facade = Self::new(config, worker, Arc::clone(&backend));
        let core = facade.core.pool.downgrade_core();
        backend.subscribe(Box::new(move |action| {
            if let Some(core) = core.upgrade() {
                debug!(action, "queue notification");
                core.kick();
            }
        }));
        facade
    }

    /// Submits one payload. A stable id is required.
    ///
    /// # Errors
    ///
    /// `MissingJobId` without an id, `SerializationFailed` when the
    /// payload does not serialize, `EnqueueRejected` when the back-end
    /// refuses the item.
    pub fn add(&self, data: T, options: JobOptions) -> Result<JobHandle<T, R>, QueueError> {
        let id = match options.id() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(QueueError::MissingJobId),
        };
        if !self.core.pool.accepting() {
            return Err(QueueError::EnqueueRejected);
        }
        let cell = JobCell::new(id, data);
        cell.set_status(JobStatus::Queued);
        let payload = cell.to_snapshot_bytes()?;
        self.core.pool.pending().add(1);
        self.core.register(&cell);
        if !self.adapter.enqueue(QueueItem::snapshot(payload)) {
            self.core.unregister(cell.id());
            self.core.pool.pending().done();
            let _ = cell.close();
            return Err(QueueError::EnqueueRejected);
        }
        debug!(job_id = %cell.id(), "job persisted");
        self.core.pool.kick();
        Ok(JobHandle::new(cell))
    }

    /// Submits a batch of identified payloads as a group job.
    ///
    /// Items that fail to serialize or enqueue are closed; the rest of
    /// the batch proceeds.
    ///
    /// # Errors
    ///
    /// `MissingJobId` when any item lacks an id; the whole batch is
    /// rejected up front in that case.
    pub fn add_all(&self, items: Vec<Item<T>>) -> Result<GroupJob<R>, QueueError> {
        if items.iter().any(|item| item.id.is_empty()) {
            return Err(QueueError::MissingJobId);
        }
        let group = GroupJob::new(group_key(&Uuid::new_v4().to_string()), items.len());
        for item in items {
            let cell = JobCell::grouped(item.id, item.value, group.stream());
            cell.set_status(JobStatus::Queued);
            let payload = match cell.to_snapshot_bytes() {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(job_id = %cell.id(), error = %err, "dropping job that failed to serialize");
                    let _ = cell.close();
                    continue;
                }
            };
            self.core.pool.pending().add(1);
            self.core.register(&cell);
            if !self.adapter.enqueue(QueueItem::snapshot(payload)) {
                self.core.unregister(cell.id());
                self.core.pool.pending().done();
                let _ = cell.close();
                warn!(group_id = %group.id(), "dropping job rejected by the back-end");
            }
        }
        self.core.pool.kick();
        self.core
            .groups
            .insert(group.id().to_string(), group.clone());
        Ok(group)
    }

    /// Looks up a job by id, scanning the back-end for jobs persisted by
    /// an earlier process when the in-memory index misses.
    pub fn job_by_id(&self, id: &str) -> Result<JobHandle<T, R>, QueueError> {
        if let Ok(handle) = self.core.job_by_id(id) {
            return Ok(handle);
        }
        for payload in self.adapter.backend().values() {
            let Ok(cell) = JobCell::<T, R>::from_snapshot_bytes(&payload) else {
                continue;
            };
            if cell.id() != id {
                continue;
            }
            // First sight of a recovered job: index it and give it a
            // wait tick. Dispatch reconciles through the same index, so
            // this handle observes the eventual execution.
            return match self.core.index.entry(id.to_string()) {
                Entry::Occupied(existing) => Ok(JobHandle::new(Arc::clone(existing.get()))),
                Entry::Vacant(vacant) => {
                    self.core.pool.pending().add(1);
                    vacant.insert(Arc::clone(&cell));
                    Ok(JobHandle::new(cell))
                }
            };
        }
        Err(QueueError::JobNotFound(id.to_string()))
    }

    /// Looks up a group job, accepting either the raw or the
    /// group-prefixed id.
    pub fn groups_job_by_id(&self, id: &str) -> Result<GroupJob<R>, QueueError> {
        self.core.groups_job_by_id(id)
    }

    /// Number of jobs waiting in the back-end.
    pub fn pending_count(&self) -> usize {
        self.core.pool.pending_count()
    }

    /// Number of jobs currently executing.
    pub fn processing_count(&self) -> usize {
        self.core.pool.current_processing()
    }

    /// Stops dispatching; in-flight jobs run to completion.
    pub fn pause(&self) {
        self.core.pool.pause();
    }

    /// Resumes dispatching and fills the free worker slots.
    pub fn resume(&self) {
        self.core.pool.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.core.pool.is_paused()
    }

    /// Waits until every tracked job has been processed. Resumes the
    /// pool first when paused.
    pub async fn wait_until_finished(&self) {
        self.core.wait_until_finished().await;
    }

    /// Pauses, drains in-flight work, recycles every worker slot, and
    /// resumes. Pending jobs are untouched and dispatch afterwards.
    pub async fn restart(&self) {
        self.core.restart().await;
    }

    /// Cancels every queued job. Executing jobs are unaffected.
    pub fn purge(&self) {
        self.core.purge();
    }

    /// Purges pending work, drains in-flight jobs, and releases the
    /// workers. Idempotent.
    pub async fn close(&self) {
        self.core.close().await;
    }

    /// Waits for every tracked job to finish, then closes.
    pub async fn wait_and_close(&self) {
        self.core.wait_and_close().await;
    }
}

/// Submit-only producer over a shared back-end.
///
/// Serializes void jobs that a consumer process bound to the same
/// back-end executes. Producers have no workers and hand out no result
/// channels.
pub struct DistributedProducer<T, B> {
    backend: Arc<B>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, B> Clone for DistributedProducer<T, B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            _marker: PhantomData,
        }
    }
}

impl<T, B> DistributedProducer<T, B>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    B: PersistentBackend,
{
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            _marker: PhantomData,
        }
    }

    /// Serializes and enqueues one identified payload.
    ///
    /// # Errors
    ///
    /// `MissingJobId` without an id, `EnqueueRejected` when the back-end
    /// refuses the item.
    pub fn add(&self, data: T, options: JobOptions) -> Result<(), QueueError> {
        let id = match options.id() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(QueueError::MissingJobId),
        };
        let cell = JobCell::<T, ()>::new(id, data);
        cell.set_status(JobStatus::Queued);
        let payload = cell.to_snapshot_bytes()?;
        if self.backend.enqueue(payload) {
            debug!(job_id = %cell.id(), "job produced");
            Ok(())
        } else {
            Err(QueueError::EnqueueRejected)
        }
    }

    /// Number of payloads waiting in the back-end.
    pub fn pending_count(&self) -> usize {
        self.backend.len()
    }

    /// Drops every payload waiting in the back-end.
    pub fn purge(&self) {
        self.backend.purge();
    }

    /// Closes the back-end.
    pub fn close(&self) {
        self.backend.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_key_normalization() {
        assert_eq!(group_key("abc"), "group:abc");
        assert_eq!(group_key("group:abc"), "group:abc");
    }

    #[test]
    fn test_item_constructor() {
        let item = Item::new("id-1", 42);
        assert_eq!(item.id, "id-1");
        assert_eq!(item.value, 42);
    }
}
