//! jobforge: an embeddable bounded-concurrency job-processing engine.
//!
//! Typed jobs are buffered in a pluggable queue (FIFO, priority, or a
//! persistent byte back-end) and executed by a fixed pool of worker
//! slots. Every submission returns a handle for result retrieval,
//! cancellation, and lifecycle inspection; batch submissions share a
//! fan-in group stream.
//!
//! # Architecture
//!
//! ```text
//!      add / add_all          ┌──────────────┐
//!    ────────────────────────▶│    Facade    │
//!                             └──────┬───────┘
//!                                    │ enqueue
//!                             ┌──────▼───────┐
//!                             │    Queue     │  FIFO / priority / bytes
//!                             └──────┬───────┘
//!                                    │ dispatch (≤ N in flight)
//!            ┌───────────────────────┼───────────────────────┐
//!            ▼                       ▼                       ▼
//!       ┌─────────┐             ┌─────────┐             ┌─────────┐
//!       │ Slot 1  │             │ Slot 2  │             │ Slot N  │
//!       └────┬────┘             └────┬────┘             └────┬────┘
//!            └───────────── job result channels ─────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use jobforge::{JobQueue, PoolConfig, WorkerKind, WorkerError};
//!
//! let queue = JobQueue::new(
//!     PoolConfig::new(4),
//!     WorkerKind::returning(|x: u64| async move { Ok::<u64, WorkerError>(x * 2) }),
//! );
//!
//! let job = queue.add(21)?;
//! assert_eq!(job.result().await?, Some(42));
//! queue.wait_and_close().await;
//! ```

pub mod config;
pub mod error;
pub mod facade;
pub mod job;
pub mod pool;
pub mod queue;

// Re-export the user-facing surface for convenience
pub use config::{JobOptions, PoolConfig};
pub use error::{JobError, QueueError, WorkerError};
pub use facade::{DistributedProducer, Item, JobQueue, PersistentJobQueue, PriorityJobQueue};
pub use job::{GroupJob, JobHandle, JobResult, JobStatus, Outcome};
pub use pool::WorkerKind;
pub use queue::{MemoryBackend, PersistentBackend, SubscribableBackend};
