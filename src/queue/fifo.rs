//! In-memory FIFO queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{BaseQueue, FifoQueue, QueueItem};

/// Mutex-guarded ring of queued items.
pub struct RingQueue<T, R> {
    items: Mutex<VecDeque<QueueItem<T, R>>>,
    closed: AtomicBool,
}

impl<T, R> RingQueue<T, R> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }
}

impl<T, R> Default for RingQueue<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R> BaseQueue<T, R> for RingQueue<T, R>
where
    T: Send + Sync,
    R: Send + Sync,
{
    fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    fn values(&self) -> Vec<QueueItem<T, R>> {
        self.items.lock().unwrap().iter().cloned().collect()
    }

    fn dequeue(&self) -> Option<QueueItem<T, R>> {
        self.items.lock().unwrap().pop_front()
    }

    fn purge(&self) {
        self.items.lock().unwrap().clear();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.purge();
    }
}

impl<T, R> FifoQueue<T, R> for RingQueue<T, R>
where
    T: Send + Sync,
    R: Send + Sync,
{
    fn enqueue(&self, item: QueueItem<T, R>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.items.lock().unwrap().push_back(item);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobCell;
    use crate::queue::ItemRepr;

    fn item(value: u32) -> QueueItem<u32, u32> {
        QueueItem::handle(JobCell::new(format!("job-{value}"), value))
    }

    fn value_of(item: &QueueItem<u32, u32>) -> u32 {
        match &item.0 {
            ItemRepr::Handle(cell) => cell.data(),
            ItemRepr::Snapshot(_) => unreachable!("fifo tests only use handles"),
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = RingQueue::new();
        for value in 1..=3 {
            assert!(queue.enqueue(item(value)));
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(value_of(&queue.dequeue().unwrap()), 1);
        assert_eq!(value_of(&queue.dequeue().unwrap()), 2);
        assert_eq!(value_of(&queue.dequeue().unwrap()), 3);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_purge_empties_queue() {
        let queue = RingQueue::new();
        queue.enqueue(item(1));
        queue.enqueue(item(2));

        assert_eq!(queue.values().len(), 2);
        queue.purge();
        assert!(queue.is_empty());
        // Purge does not close the queue.
        assert!(queue.enqueue(item(3)));
    }

    #[test]
    fn test_closed_queue_rejects_enqueue() {
        let queue = RingQueue::new();
        queue.enqueue(item(1));
        queue.close();

        assert!(queue.is_empty());
        assert!(!queue.enqueue(item(2)));
    }
}
