//! Job lifecycle types.
//!
//! This module defines the unit of work and its external view:
//!
//! - `JobStatus`: the atomic lifecycle state machine
//! - `Outcome` / `JobResult`: what workers deliver
//! - `JobHandle`: the external, thread-safe view of a submitted job
//! - `GroupJob`: fan-in aggregator over a batch of sibling jobs

pub(crate) mod group;
pub(crate) mod result_channel;
pub(crate) mod snapshot;

pub use group::GroupJob;

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{JobError, QueueError, WorkerError};
use crate::queue::Acknowledger;
use group::GroupStream;
use result_channel::ResultChannel;

/// Lifecycle state of a job.
///
/// Transitions are monotonic: `Created -> Queued -> Processing ->
/// Finished -> Closed`, except that a job which never reaches a worker
/// slot may jump straight to `Closed` via purge or close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobStatus {
    /// The job has been created but not yet queued.
    Created = 0,
    /// The job is waiting in the queue.
    Queued = 1,
    /// The job is currently executing in a worker slot.
    Processing = 2,
    /// The job has completed execution.
    Finished = 3,
    /// The job has been closed and its resources released.
    Closed = 4,
}

impl JobStatus {
    /// Canonical wire string for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "Created",
            JobStatus::Queued => "Queued",
            JobStatus::Processing => "Processing",
            JobStatus::Finished => "Finished",
            JobStatus::Closed => "Closed",
        }
    }

    /// Parses a wire string back into a status.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::InvalidStatus` for anything outside the
    /// closed set of status strings.
    pub fn parse(s: &str) -> Result<Self, QueueError> {
        match s {
            "Created" => Ok(JobStatus::Created),
            "Queued" => Ok(JobStatus::Queued),
            "Processing" => Ok(JobStatus::Processing),
            "Finished" => Ok(JobStatus::Finished),
            "Closed" => Ok(JobStatus::Closed),
            other => Err(QueueError::InvalidStatus(other.to_string())),
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => JobStatus::Created,
            1 => JobStatus::Queued,
            2 => JobStatus::Processing,
            3 => JobStatus::Finished,
            _ => JobStatus::Closed,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload delivered through a job's result sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome<R> {
    /// Value produced by a returning worker.
    Data(R),
    /// Completion marker from a void worker.
    Void,
    /// The worker failed.
    Error(WorkerError),
}

/// Result of one job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult<R> {
    /// Id of the job that produced this result.
    pub job_id: String,
    /// What the worker produced.
    pub outcome: Outcome<R>,
}

impl<R> JobResult<R> {
    pub(crate) fn data(job_id: &str, value: R) -> Self {
        Self {
            job_id: job_id.to_string(),
            outcome: Outcome::Data(value),
        }
    }

    pub(crate) fn void(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            outcome: Outcome::Void,
        }
    }

    pub(crate) fn error(job_id: &str, err: WorkerError) -> Self {
        Self {
            job_id: job_id.to_string(),
            outcome: Outcome::Error(err),
        }
    }

    /// Returns true when the outcome is a worker failure.
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }
}

/// Where a job delivers its result: an owned channel for standalone jobs
/// or the shared stream of its group.
pub(crate) enum JobSink<R> {
    Single(ResultChannel<R>),
    Group(Arc<GroupStream<R>>),
}

/// Ack obligation recorded when an acknowledging queue hands out a job.
/// The queue reference is weak: the job may acknowledge through it but
/// never owns it.
#[derive(Clone)]
pub(crate) struct AckBinding {
    ack_id: String,
    queue: Weak<dyn Acknowledger>,
}

/// Internal job state shared between the facade, the queue, and the
/// worker pool.
pub(crate) struct JobCell<T, R> {
    id: String,
    input: T,
    status: AtomicU8,
    /// Last result, retained after the sink closes so late readers never
    /// observe an ambiguous missing value.
    output: Mutex<Option<JobResult<R>>>,
    sink: JobSink<R>,
    /// Guards the one-time sink close / group settle.
    settled: AtomicBool,
    ack: Mutex<Option<AckBinding>>,
    created_at: DateTime<Utc>,
}

impl<T, R> std::fmt::Debug for JobCell<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCell")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<T, R> JobCell<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Creates a standalone job with its own single-slot result channel.
    pub(crate) fn new(id: String, input: T) -> Arc<Self> {
        Arc::new(Self {
            id,
            input,
            status: AtomicU8::new(JobStatus::Created as u8),
            output: Mutex::new(None),
            sink: JobSink::Single(ResultChannel::new(1)),
            settled: AtomicBool::new(false),
            ack: Mutex::new(None),
            created_at: Utc::now(),
        })
    }

    /// Creates a job joined to a group's shared result stream.
    pub(crate) fn grouped(id: String, input: T, stream: Arc<GroupStream<R>>) -> Arc<Self> {
        Arc::new(Self {
            id,
            input,
            status: AtomicU8::new(JobStatus::Created as u8),
            output: Mutex::new(None),
            sink: JobSink::Group(stream),
            settled: AtomicBool::new(false),
            ack: Mutex::new(None),
            created_at: Utc::now(),
        })
    }

    /// Rebuilds a job from a deserialized snapshot.
    pub(crate) fn rehydrated(
        id: String,
        input: T,
        status: JobStatus,
        output: Option<JobResult<R>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            input,
            status: AtomicU8::new(status as u8),
            output: Mutex::new(output),
            sink: JobSink::Single(ResultChannel::new(1)),
            settled: AtomicBool::new(false),
            ack: Mutex::new(None),
            created_at: Utc::now(),
        })
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn data(&self) -> T {
        self.input.clone()
    }

    pub(crate) fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn set_status(&self, status: JobStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.status() == JobStatus::Closed
    }

    /// Claims the job for execution. Fails only when the job is closed,
    /// which lets the dispatcher discard cancelled jobs without racing a
    /// concurrent `close`.
    pub(crate) fn begin_processing(&self) -> bool {
        loop {
            let current = self.status.load(Ordering::SeqCst);
            if current == JobStatus::Closed as u8 {
                return false;
            }
            if self
                .status
                .compare_exchange(
                    current,
                    JobStatus::Processing as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    pub(crate) fn bind_ack(&self, ack_id: String, queue: Weak<dyn Acknowledger>) {
        *self.ack.lock().unwrap() = Some(AckBinding { ack_id, queue });
    }

    pub(crate) fn output_clone(&self) -> Option<JobResult<R>> {
        self.output.lock().unwrap().clone()
    }

    /// Stores the result and pushes it into the sink.
    pub(crate) async fn save_and_send(&self, result: JobResult<R>) {
        *self.output.lock().unwrap() = Some(result.clone());
        match &self.sink {
            JobSink::Single(channel) => channel.send(result).await,
            JobSink::Group(stream) => stream.push(result),
        }
    }

    /// Closes the result sink exactly once: the channel for standalone
    /// jobs, one settled child for grouped jobs.
    pub(crate) fn close_sink(&self) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.sink {
            JobSink::Single(channel) => channel.close(),
            JobSink::Group(stream) => stream.settle_one(),
        }
    }

    /// Waits for the job's result, falling back to the retained output
    /// once the channel has closed.
    pub(crate) async fn result(&self) -> Result<Option<R>, JobError> {
        let received = match &self.sink {
            JobSink::Single(channel) => channel.recv().await?,
            // Grouped results are delivered through the group's stream.
            JobSink::Group(_) => None,
        };
        let result = match received {
            Some(result) => result,
            None => self
                .output_clone()
                .ok_or_else(|| JobError::ResultUnavailable(self.id.clone()))?,
        };
        match result.outcome {
            Outcome::Data(value) => Ok(Some(value)),
            Outcome::Void => Ok(None),
            Outcome::Error(err) => Err(JobError::WorkerFailed(err)),
        }
    }

    /// Consumes and discards any pending result in the background.
    pub(crate) fn drain(&self) -> Result<(), JobError> {
        let mut rx = match &self.sink {
            JobSink::Single(channel) => channel.take_receiver()?,
            JobSink::Group(_) => return Err(JobError::AlreadyConsumed),
        };
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Ok(())
    }

    /// Closes the job: closes the sink, attempts an ack, transitions to
    /// `Closed`.
    ///
    /// # Errors
    ///
    /// `ProcessingCannotClose` while the job occupies a worker slot,
    /// `AlreadyClosed` on repeat closes.
    pub(crate) fn close(&self) -> Result<(), JobError> {
        loop {
            let current = self.status.load(Ordering::SeqCst);
            match JobStatus::from_u8(current) {
                JobStatus::Processing => {
                    return Err(JobError::ProcessingCannotClose(self.id.clone()))
                }
                JobStatus::Closed => return Err(JobError::AlreadyClosed(self.id.clone())),
                _ => {}
            }
            if self
                .status
                .compare_exchange(
                    current,
                    JobStatus::Closed as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                break;
            }
        }
        self.close_sink();
        let _ = self.try_ack();
        Ok(())
    }

    /// Acknowledges the job to its owning queue.
    pub(crate) fn ack(&self) -> Result<(), JobError> {
        if self.is_closed() {
            return Err(JobError::NotAcknowledgeable(self.id.clone()));
        }
        self.try_ack()
    }

    /// Takes the ack binding and invokes the queue. Taking the binding on
    /// the first attempt keeps the queue-side ack an exactly-once call.
    pub(crate) fn try_ack(&self) -> Result<(), JobError> {
        let binding = {
            let mut guard = self.ack.lock().unwrap();
            match guard.as_ref() {
                Some(binding) if !binding.ack_id.is_empty() => guard.take(),
                _ => None,
            }
        };
        let Some(binding) = binding else {
            return Err(JobError::NotAcknowledgeable(self.id.clone()));
        };
        let Some(queue) = binding.queue.upgrade() else {
            return Err(JobError::NotAcknowledgeable(self.id.clone()));
        };
        if queue.acknowledge(&binding.ack_id) {
            Ok(())
        } else {
            Err(JobError::AckRejected {
                id: self.id.clone(),
                ack_id: binding.ack_id,
            })
        }
    }
}

/// External, thread-safe view of a submitted job.
///
/// Handles are cheap to clone and stay valid after the job finishes;
/// late readers fall back to the job's retained output.
pub struct JobHandle<T, R> {
    cell: Arc<JobCell<T, R>>,
}

impl<T, R> Clone for JobHandle<T, R> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T, R> std::fmt::Debug for JobHandle<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.cell.id())
            .field("status", &self.cell.status())
            .finish()
    }
}

impl<T, R> JobHandle<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(cell: Arc<JobCell<T, R>>) -> Self {
        Self { cell }
    }

    /// The job's stable id, empty when none was assigned.
    pub fn id(&self) -> &str {
        self.cell.id()
    }

    /// Current lifecycle status.
    pub fn status(&self) -> JobStatus {
        self.cell.status()
    }

    /// Returns true once the job is closed.
    pub fn is_closed(&self) -> bool {
        self.cell.is_closed()
    }

    /// A copy of the submitted input.
    pub fn data(&self) -> T {
        self.cell.data()
    }

    /// When the job was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.cell.created_at()
    }

    /// Waits for the job's result.
    ///
    /// Returns `Ok(Some(value))` for returning workers, `Ok(None)` for
    /// void workers, and the worker's error otherwise. Once the channel
    /// has closed the retained output is used, so repeat calls observe
    /// the same result.
    ///
    /// # Errors
    ///
    /// `ResultUnavailable` when the job was closed before producing
    /// anything, `WorkerFailed` for worker errors.
    pub async fn result(&self) -> Result<Option<R>, JobError> {
        self.cell.result().await
    }

    /// Starts discarding any pending result in the background. Safe to
    /// call once; the result channel counts as consumed afterwards.
    pub fn drain(&self) -> Result<(), JobError> {
        self.cell.drain()
    }

    /// Cancels the job.
    ///
    /// Succeeds only while the job has not entered `Processing`; running
    /// jobs cannot be preempted.
    pub fn close(&self) -> Result<(), JobError> {
        self.cell.close()
    }

    /// Acknowledges the job to an acknowledging queue.
    ///
    /// # Errors
    ///
    /// `NotAcknowledgeable` without an ack binding or once closed,
    /// `AckRejected` when the back-end refuses.
    pub fn ack(&self) -> Result<(), JobError> {
        self.cell.ack()
    }
}
