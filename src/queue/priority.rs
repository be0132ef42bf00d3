//! In-memory priority queue.
//!
//! Dequeue order is smallest priority first; entries at equal priority
//! dequeue in insertion order.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{BaseQueue, PriorityQueue, QueueItem};

struct HeapEntry<T, R> {
    priority: i64,
    seq: u64,
    item: QueueItem<T, R>,
}

impl<T, R> PartialEq for HeapEntry<T, R> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T, R> Eq for HeapEntry<T, R> {}

impl<T, R> PartialOrd for HeapEntry<T, R> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T, R> Ord for HeapEntry<T, R> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; compare reversed so the smallest
        // (priority, seq) pair surfaces first.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Mutex-guarded binary heap keyed by `(priority, insertion index)`.
pub struct HeapQueue<T, R> {
    state: Mutex<HeapState<T, R>>,
    closed: AtomicBool,
}

struct HeapState<T, R> {
    heap: BinaryHeap<HeapEntry<T, R>>,
    insertion_count: u64,
}

impl<T, R> HeapQueue<T, R> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState {
                heap: BinaryHeap::new(),
                insertion_count: 0,
            }),
            closed: AtomicBool::new(false),
        }
    }
}

impl<T, R> Default for HeapQueue<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R> BaseQueue<T, R> for HeapQueue<T, R>
where
    T: Send + Sync,
    R: Send + Sync,
{
    fn len(&self) -> usize {
        self.state.lock().unwrap().heap.len()
    }

    fn values(&self) -> Vec<QueueItem<T, R>> {
        let state = self.state.lock().unwrap();
        state.heap.iter().map(|entry| entry.item.clone()).collect()
    }

    fn dequeue(&self) -> Option<QueueItem<T, R>> {
        self.state.lock().unwrap().heap.pop().map(|entry| entry.item)
    }

    fn purge(&self) {
        self.state.lock().unwrap().heap.clear();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.purge();
    }
}

impl<T, R> PriorityQueue<T, R> for HeapQueue<T, R>
where
    T: Send + Sync,
    R: Send + Sync,
{
    fn enqueue(&self, item: QueueItem<T, R>, priority: i64) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        let seq = state.insertion_count;
        state.insertion_count += 1;
        state.heap.push(HeapEntry {
            priority,
            seq,
            item,
        });
        true
    }
}
