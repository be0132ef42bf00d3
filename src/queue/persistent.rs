//! Persistent queue boundary.
//!
//! Back-ends move opaque byte payloads (serialized job snapshots) and
//! may require explicit acknowledgement per dequeued item. The adapter
//! lifts a back-end into the queue capability lattice the pool consumes;
//! `MemoryBackend` is the in-process reference implementation used in
//! tests and as the model of the contract.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use super::{AckQueue, Acknowledger, BaseQueue, FifoQueue, ItemRepr, QueueItem};

/// Callback invoked when a back-end observes external activity.
pub type SubscribeCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Byte-level contract a persistent back-end must satisfy.
///
/// Payloads are UTF-8 JSON job snapshots; the back-end never inspects
/// them. A non-empty ack id from `dequeue_with_ack_id` obliges the
/// scheduler to call `acknowledge` exactly once after the job finishes.
pub trait PersistentBackend: Send + Sync {
    /// Stores a payload; false signals back-pressure or failure.
    fn enqueue(&self, payload: Vec<u8>) -> bool;

    /// Removes the next payload together with its ack id.
    fn dequeue_with_ack_id(&self) -> Option<(Vec<u8>, String)>;

    /// Confirms a dequeued payload was fully processed.
    fn acknowledge(&self, ack_id: &str) -> bool;

    /// Number of payloads ready for dequeue.
    fn len(&self) -> usize;

    /// Snapshot of the ready payloads.
    fn values(&self) -> Vec<Vec<u8>>;

    /// Drops every ready payload. Leased items are unaffected.
    fn purge(&self);

    /// Closes the back-end; later enqueues are rejected.
    fn close(&self);
}

/// Back-ends that can report externally enqueued items.
pub trait SubscribableBackend: PersistentBackend {
    /// Registers a callback invoked with an action string (for example
    /// `"enqueued"`) when items arrive.
    fn subscribe(&self, callback: SubscribeCallback);
}

/// Lifts a byte back-end into the queue traits by wrapping payloads as
/// snapshot items.
pub struct PersistentAdapter<T, R, B> {
    backend: Arc<B>,
    _marker: PhantomData<fn() -> (T, R)>,
}

impl<T, R, B> PersistentAdapter<T, R, B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            _marker: PhantomData,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }
}

impl<T, R, B> BaseQueue<T, R> for PersistentAdapter<T, R, B>
where
    B: PersistentBackend,
    T: Send + Sync,
    R: Send + Sync,
{
    fn len(&self) -> usize {
        self.backend.len()
    }

    fn values(&self) -> Vec<QueueItem<T, R>> {
        self.backend
            .values()
            .into_iter()
            .map(QueueItem::snapshot)
            .collect()
    }

    fn dequeue(&self) -> Option<QueueItem<T, R>> {
        self.backend
            .dequeue_with_ack_id()
            .map(|(payload, _)| QueueItem::snapshot(payload))
    }

    fn purge(&self) {
        self.backend.purge();
    }

    fn close(&self) {
        self.backend.close();
    }
}

impl<T, R, B> FifoQueue<T, R> for PersistentAdapter<T, R, B>
where
    B: PersistentBackend,
    T: Send + Sync,
    R: Send + Sync,
{
    fn enqueue(&self, item: QueueItem<T, R>) -> bool {
        match item.0 {
            ItemRepr::Snapshot(payload) => self.backend.enqueue(payload),
            // Live handles never route to byte back-ends.
            ItemRepr::Handle(_) => false,
        }
    }
}

impl<T, R, B> Acknowledger for PersistentAdapter<T, R, B>
where
    B: PersistentBackend,
    T: Send + Sync,
    R: Send + Sync,
{
    fn acknowledge(&self, ack_id: &str) -> bool {
        self.backend.acknowledge(ack_id)
    }
}

impl<T, R, B> AckQueue<T, R> for PersistentAdapter<T, R, B>
where
    B: PersistentBackend,
    T: Send + Sync,
    R: Send + Sync,
{
    fn dequeue_with_ack_id(&self) -> Option<(QueueItem<T, R>, String)> {
        self.backend
            .dequeue_with_ack_id()
            .map(|(payload, ack_id)| (QueueItem::snapshot(payload), ack_id))
    }
}

/// In-process reference back-end: a ready deque plus a leased map keyed
/// by ack id.
///
/// Dequeued payloads move to the leased map until acknowledged, the
/// in-memory analogue of an atomic move onto a processing queue.
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    subscribers: Mutex<Vec<SubscribeCallback>>,
    closed: AtomicBool,
    acks: AtomicUsize,
}

#[derive(Default)]
struct MemoryState {
    ready: VecDeque<Vec<u8>>,
    leased: HashMap<String, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MemoryState::default()),
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            acks: AtomicUsize::new(0),
        })
    }

    /// Number of dequeued-but-unacknowledged payloads.
    pub fn outstanding_leases(&self) -> usize {
        self.state.lock().unwrap().leased.len()
    }

    /// Total successful acknowledgements.
    pub fn ack_count(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    /// Callbacks run with the state lock released so a subscriber can
    /// immediately dequeue.
    fn notify(&self, action: &str) {
        let subscribers = self.subscribers.lock().unwrap();
        for callback in subscribers.iter() {
            callback(action);
        }
    }
}

impl PersistentBackend for MemoryBackend {
    fn enqueue(&self, payload: Vec<u8>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.state.lock().unwrap().ready.push_back(payload);
        self.notify("enqueued");
        true
    }

    fn dequeue_with_ack_id(&self) -> Option<(Vec<u8>, String)> {
        let mut state = self.state.lock().unwrap();
        let payload = state.ready.pop_front()?;
        let ack_id = Uuid::new_v4().to_string();
        state.leased.insert(ack_id.clone(), payload.clone());
        Some((payload, ack_id))
    }

    fn acknowledge(&self, ack_id: &str) -> bool {
        let removed = self.state.lock().unwrap().leased.remove(ack_id).is_some();
        if removed {
            self.acks.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    fn len(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    fn values(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().ready.iter().cloned().collect()
    }

    fn purge(&self) {
        self.state.lock().unwrap().ready.clear();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.purge();
    }
}

impl SubscribableBackend for MemoryBackend {
    fn subscribe(&self, callback: SubscribeCallback) {
        self.subscribers.lock().unwrap().push(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_lease_until_acknowledged() {
        let backend = MemoryBackend::new();
        assert!(backend.enqueue(b"one".to_vec()));

        let (payload, ack_id) = backend.dequeue_with_ack_id().unwrap();
        assert_eq!(payload, b"one".to_vec());
        assert!(!ack_id.is_empty());
        assert_eq!(backend.len(), 0);
        assert_eq!(backend.outstanding_leases(), 1);

        assert!(backend.acknowledge(&ack_id));
        assert_eq!(backend.outstanding_leases(), 0);
        assert_eq!(backend.ack_count(), 1);
    }

    #[test]
    fn test_double_acknowledge_rejected() {
        let backend = MemoryBackend::new();
        backend.enqueue(b"one".to_vec());
        let (_, ack_id) = backend.dequeue_with_ack_id().unwrap();

        assert!(backend.acknowledge(&ack_id));
        assert!(!backend.acknowledge(&ack_id));
        assert_eq!(backend.ack_count(), 1);
    }

    #[test]
    fn test_unknown_ack_id_rejected() {
        let backend = MemoryBackend::new();
        assert!(!backend.acknowledge("no-such-lease"));
    }

    #[test]
    fn test_fifo_payload_order() {
        let backend = MemoryBackend::new();
        backend.enqueue(b"a".to_vec());
        backend.enqueue(b"b".to_vec());

        assert_eq!(backend.dequeue_with_ack_id().unwrap().0, b"a".to_vec());
        assert_eq!(backend.dequeue_with_ack_id().unwrap().0, b"b".to_vec());
    }

    #[test]
    fn test_purge_leaves_leases_alone() {
        let backend = MemoryBackend::new();
        backend.enqueue(b"a".to_vec());
        backend.enqueue(b"b".to_vec());
        let _lease = backend.dequeue_with_ack_id().unwrap();

        backend.purge();
        assert_eq!(backend.len(), 0);
        assert_eq!(backend.outstanding_leases(), 1);
    }

    #[test]
    fn test_closed_backend_rejects_enqueue() {
        let backend = MemoryBackend::new();
        backend.close();
        assert!(!backend.enqueue(b"late".to_vec()));
    }

    #[test]
    fn test_subscriber_sees_enqueues() {
        let backend = MemoryBackend::new();
        let observed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&observed);
        backend.subscribe(Box::new(move |action| {
            assert_eq!(action, "enqueued");
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        backend.enqueue(b"a".to_vec());
        backend.enqueue(b"b".to_vec());
        assert_eq!(observed.load(Ordering::SeqCst), 2);
    }
}
