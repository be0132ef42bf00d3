//! Counter of live jobs with async wait support.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// Counts submitted jobs that have not yet reached a terminal state.
///
/// `sub` saturates at zero: purged items that never carried a tick
/// (snapshots enqueued by another process) must not drive the counter
/// negative.
pub(crate) struct WaitGroup {
    count: AtomicUsize,
    notify: Notify,
}

impl WaitGroup {
    pub(crate) fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub(crate) fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::SeqCst);
    }

    pub(crate) fn done(&self) {
        self.sub(1);
    }

    pub(crate) fn sub(&self, n: usize) {
        let mut current = self.count.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(n);
            match self
                .count
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    if next == 0 {
                        self.notify.notify_waiters();
                    }
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Waits until the counter reaches zero.
    pub(crate) async fn wait(&self) {
        loop {
            // Register interest before re-checking so a concurrent drop
            // to zero cannot slip between the check and the await.
            let notified = self.notify.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_immediately_at_zero() {
        let group = WaitGroup::new();
        group.wait().await;
    }

    #[tokio::test]
    async fn test_wait_blocks_until_done() {
        let group = Arc::new(WaitGroup::new());
        group.add(2);

        let waiter = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        group.done();
        group.done();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter should not panic");
    }

    #[tokio::test]
    async fn test_sub_saturates_at_zero() {
        let group = WaitGroup::new();
        group.add(1);
        group.sub(5);
        // The counter sits at zero, not underflowed: wait returns.
        tokio::time::timeout(Duration::from_millis(100), group.wait())
            .await
            .expect("saturated group should be at zero");
    }
}
