//! Group jobs: fan-in over a batch of sibling jobs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::error::JobError;
use crate::job::JobResult;

/// Producer side of a group's shared result stream.
///
/// The outstanding counter is initialized to the batch size up front, so
/// a child finishing while later siblings are still being enqueued can
/// never close the stream early. The decrement and the close decision are
/// one atomic `fetch_sub`.
pub(crate) struct GroupStream<R> {
    tx: Mutex<Option<mpsc::Sender<JobResult<R>>>>,
    outstanding: AtomicUsize,
}

impl<R> GroupStream<R> {
    fn new(tx: Option<mpsc::Sender<JobResult<R>>>, children: usize) -> Self {
        Self {
            tx: Mutex::new(tx),
            outstanding: AtomicUsize::new(children),
        }
    }

    /// Pushes a child result. The stream is sized to the batch, so the
    /// send never blocks.
    pub(crate) fn push(&self, result: JobResult<R>) {
        let tx = self.tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.try_send(result);
        }
    }

    /// Marks one child terminal; the last one closes the stream.
    pub(crate) fn settle_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tx.lock().unwrap().take();
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// Aggregator handle over a batch of sibling jobs sharing one result
/// stream.
///
/// The stream yields exactly one result per child in completion order
/// (not submission order) and ends once every child has reached a
/// terminal state, whether it finished or was closed.
pub struct GroupJob<R> {
    inner: Arc<GroupInner<R>>,
}

impl<R> std::fmt::Debug for GroupJob<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupJob").finish_non_exhaustive()
    }
}

struct GroupInner<R> {
    id: String,
    stream: Arc<GroupStream<R>>,
    rx: Mutex<Option<mpsc::Receiver<JobResult<R>>>>,
    consumed: AtomicBool,
}

impl<R> Clone for GroupJob<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R> GroupJob<R> {
    pub(crate) fn new(id: String, children: usize) -> Self {
        let (tx, rx) = mpsc::channel(children.max(1));
        // An empty batch has nothing to wait for; close immediately.
        let tx = if children == 0 { None } else { Some(tx) };
        Self {
            inner: Arc::new(GroupInner {
                id,
                stream: Arc::new(GroupStream::new(tx, children)),
                rx: Mutex::new(Some(rx)),
                consumed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn stream(&self) -> Arc<GroupStream<R>> {
        Arc::clone(&self.inner.stream)
    }

    /// The group's prefixed id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Number of children not yet in a terminal state.
    pub fn remaining(&self) -> usize {
        self.inner.stream.outstanding()
    }

    /// Takes the shared result stream.
    ///
    /// Yields one result per child in completion order and ends once the
    /// whole batch is terminal. Can only be taken once; later calls fail
    /// with `AlreadyConsumed`.
    pub fn results(&self) -> Result<mpsc::Receiver<JobResult<R>>, JobError> {
        if self.inner.consumed.swap(true, Ordering::SeqCst) {
            return Err(JobError::AlreadyConsumed);
        }
        self.inner
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or(JobError::AlreadyConsumed)
    }
}
