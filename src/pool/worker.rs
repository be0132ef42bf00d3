//! Worker flavors and the execution step.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error};

use crate::error::WorkerError;
use crate::job::{JobCell, JobResult};

type BoxFuture<O> = Pin<Box<dyn Future<Output = O> + Send>>;
type ReturningFn<T, R> = Arc<dyn Fn(T) -> BoxFuture<Result<R, WorkerError>> + Send + Sync>;
type VoidFn<T> = Arc<dyn Fn(T) -> BoxFuture<Result<(), WorkerError>> + Send + Sync>;

/// The user-supplied function executed for each job.
///
/// Returning workers deliver a value through the job's result; void
/// workers only signal completion or failure, so their results carry no
/// data.
pub enum WorkerKind<T, R> {
    Returning(ReturningFn<T, R>),
    Void(VoidFn<T>),
}

impl<T, R> Clone for WorkerKind<T, R> {
    fn clone(&self) -> Self {
        match self {
            WorkerKind::Returning(worker) => WorkerKind::Returning(Arc::clone(worker)),
            WorkerKind::Void(worker) => WorkerKind::Void(Arc::clone(worker)),
        }
    }
}

impl<T, R> WorkerKind<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Wraps an async function producing a value per job.
    pub fn returning<F, Fut>(worker: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, WorkerError>> + Send + 'static,
    {
        WorkerKind::Returning(Arc::new(move |input| Box::pin(worker(input))))
    }

    /// Wraps an async function that only signals completion.
    pub fn void<F, Fut>(worker: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        WorkerKind::Void(Arc::new(move |input| Box::pin(worker(input))))
    }

    /// Runs the worker for one job and pushes the outcome into the job's
    /// sink. Panics are contained and surface as worker errors so one bad
    /// job cannot take the executor down.
    pub(crate) async fn execute(&self, cell: &Arc<JobCell<T, R>>) {
        let input = cell.data();
        let result = match self {
            WorkerKind::Returning(worker) => {
                match AssertUnwindSafe(worker(input)).catch_unwind().await {
                    Ok(Ok(value)) => JobResult::data(cell.id(), value),
                    Ok(Err(err)) => JobResult::error(cell.id(), err),
                    Err(panic) => {
                        error!(job_id = %cell.id(), "worker panicked");
                        JobResult::error(cell.id(), WorkerError::new(panic_message(panic.as_ref())))
                    }
                }
            }
            WorkerKind::Void(worker) => {
                match AssertUnwindSafe(worker(input)).catch_unwind().await {
                    Ok(Ok(())) => JobResult::void(cell.id()),
                    Ok(Err(err)) => JobResult::error(cell.id(), err),
                    Err(panic) => {
                        error!(job_id = %cell.id(), "worker panicked");
                        JobResult::error(cell.id(), WorkerError::new(panic_message(panic.as_ref())))
                    }
                }
            }
        };
        debug!(job_id = %cell.id(), failed = result.is_error(), "worker finished");
        cell.save_and_send(result).await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("worker panicked: {message}")
    } else {
        "worker panicked".to_string()
    }
}
