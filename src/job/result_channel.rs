//! Single-consumer result sink for standalone jobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::JobError;
use crate::job::JobResult;

/// Bounded single-producer/single-consumer sink for a job's result.
///
/// The sender half lives in an `Option` so closing the sink is dropping
/// the sender; a receiver drains any buffered value first and only then
/// observes the closed state. The receiver can be taken out exactly once.
pub(crate) struct ResultChannel<R> {
    tx: Mutex<Option<mpsc::Sender<JobResult<R>>>>,
    rx: tokio::sync::Mutex<Option<mpsc::Receiver<JobResult<R>>>>,
    consumed: AtomicBool,
}

impl<R> ResultChannel<R> {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(Some(rx)),
            consumed: AtomicBool::new(false),
        }
    }

    /// Sends a result. Waits only when the buffer is full; a send after
    /// close is dropped.
    pub(crate) async fn send(&self, result: JobResult<R>) {
        let tx = self.tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(result).await;
        }
    }

    /// Hands out the receiver. Fails on every call after the first.
    pub(crate) fn take_receiver(&self) -> Result<mpsc::Receiver<JobResult<R>>, JobError> {
        if self.consumed.swap(true, Ordering::SeqCst) {
            return Err(JobError::AlreadyConsumed);
        }
        match self.rx.try_lock() {
            Ok(mut guard) => guard.take().ok_or(JobError::AlreadyConsumed),
            // A reader is mid-recv, which counts as consumption.
            Err(_) => Err(JobError::AlreadyConsumed),
        }
    }

    /// Receives the next value, waiting until one arrives or the sink
    /// closes. `Ok(None)` means closed and drained.
    pub(crate) async fn recv(&self) -> Result<Option<JobResult<R>>, JobError> {
        let mut guard = self.rx.lock().await;
        match guard.as_mut() {
            Some(rx) => Ok(rx.recv().await),
            None => Err(JobError::AlreadyConsumed),
        }
    }

    /// Closes the sink. Idempotent.
    pub(crate) fn close(&self) {
        self.tx.lock().unwrap().take();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.lock().unwrap().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Outcome;

    fn result(value: u32) -> JobResult<u32> {
        JobResult {
            job_id: "job-1".to_string(),
            outcome: Outcome::Data(value),
        }
    }

    #[tokio::test]
    async fn test_send_then_recv() {
        let channel = ResultChannel::new(1);
        channel.send(result(7)).await;

        let received = channel.recv().await.expect("receiver still in place");
        assert_eq!(received, Some(result(7)));
    }

    #[tokio::test]
    async fn test_buffered_value_survives_close() {
        let channel = ResultChannel::new(1);
        channel.send(result(7)).await;
        channel.close();
        assert!(channel.is_closed());

        assert_eq!(channel.recv().await.unwrap(), Some(result(7)));
        assert_eq!(channel.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_take_receiver_only_once() {
        let channel = ResultChannel::<u32>::new(1);
        assert!(channel.take_receiver().is_ok());

        let err = channel.take_receiver().unwrap_err();
        assert!(matches!(err, JobError::AlreadyConsumed));
    }

    #[tokio::test]
    async fn test_recv_after_take_fails() {
        let channel = ResultChannel::<u32>::new(1);
        let _rx = channel.take_receiver().unwrap();

        let err = channel.recv().await.unwrap_err();
        assert!(matches!(err, JobError::AlreadyConsumed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let channel = ResultChannel::<u32>::new(1);
        channel.close();
        channel.close();
        assert_eq!(channel.recv().await.unwrap(), None);
    }
}
