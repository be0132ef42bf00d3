//! Configuration builders for pools and job submissions.

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent worker slots. Always at least one.
    pub concurrency: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

impl PoolConfig {
    /// Creates a configuration with the specified concurrency.
    ///
    /// Concurrency is clamped to at least one slot.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Sets the concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    id: Option<String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a stable id to the job.
    ///
    /// Optional for in-memory queues (an id is generated when absent),
    /// required for persistent and distributed submissions.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub(crate) fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}
