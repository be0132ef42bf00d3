//! Queue abstraction consumed by the worker pool.
//!
//! Queues move opaque `QueueItem`s: in-memory queues hold live job
//! references, persistent queues hold serialized snapshots that the pool
//! rehydrates on dequeue. Capabilities are layered as small traits so the
//! pool can drive anything from a VecDeque to an acknowledging,
//! subscribable byte back-end.

pub(crate) mod fifo;
pub(crate) mod persistent;
pub(crate) mod priority;

pub use fifo::RingQueue;
pub use persistent::{
    MemoryBackend, PersistentAdapter, PersistentBackend, SubscribableBackend, SubscribeCallback,
};
pub use priority::HeapQueue;

use std::sync::Arc;

use crate::job::JobCell;

/// An entry sitting in a queue: either a live in-memory job or a
/// serialized snapshot from a persistent back-end.
pub struct QueueItem<T, R>(pub(crate) ItemRepr<T, R>);

pub(crate) enum ItemRepr<T, R> {
    Handle(Arc<JobCell<T, R>>),
    Snapshot(Vec<u8>),
}

impl<T, R> Clone for QueueItem<T, R> {
    fn clone(&self) -> Self {
        Self(match &self.0 {
            ItemRepr::Handle(cell) => ItemRepr::Handle(Arc::clone(cell)),
            ItemRepr::Snapshot(bytes) => ItemRepr::Snapshot(bytes.clone()),
        })
    }
}

impl<T, R> QueueItem<T, R> {
    pub(crate) fn handle(cell: Arc<JobCell<T, R>>) -> Self {
        Self(ItemRepr::Handle(cell))
    }

    pub(crate) fn snapshot(bytes: Vec<u8>) -> Self {
        Self(ItemRepr::Snapshot(bytes))
    }
}

/// Root capability every queue the pool can drive must provide.
pub trait BaseQueue<T, R>: Send + Sync {
    /// Number of items waiting in the queue.
    fn len(&self) -> usize;

    /// Returns true when nothing is waiting.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the queued items, in no particular order.
    fn values(&self) -> Vec<QueueItem<T, R>>;

    /// Removes and returns the next item.
    fn dequeue(&self) -> Option<QueueItem<T, R>>;

    /// Drops every queued item.
    fn purge(&self);

    /// Closes the queue; later enqueues are rejected.
    fn close(&self);
}

/// FIFO enqueue capability.
pub trait FifoQueue<T, R>: BaseQueue<T, R> {
    /// Appends an item; false signals back-pressure or a closed queue.
    fn enqueue(&self, item: QueueItem<T, R>) -> bool;
}

/// Priority enqueue capability: smallest priority dequeues first, equal
/// priorities dequeue in insertion order.
pub trait PriorityQueue<T, R>: BaseQueue<T, R> {
    /// Inserts an item at the given priority; false signals
    /// back-pressure or a closed queue.
    fn enqueue(&self, item: QueueItem<T, R>, priority: i64) -> bool;
}

/// Ack-only view a job keeps of its owning queue. Object-safe so jobs
/// can hold it weakly without owning the queue.
pub trait Acknowledger: Send + Sync {
    /// Confirms that a dequeued item was fully processed. Returns false
    /// when the ack id is unknown or already consumed.
    fn acknowledge(&self, ack_id: &str) -> bool;
}

/// Queues whose items must be acknowledged after processing.
pub trait AckQueue<T, R>: BaseQueue<T, R> + Acknowledger {
    /// Removes the next item together with its ack id. A non-empty ack
    /// id obliges the scheduler to acknowledge once the job finishes.
    fn dequeue_with_ack_id(&self) -> Option<(QueueItem<T, R>, String)>;
}
