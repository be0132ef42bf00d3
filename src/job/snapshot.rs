//! Serialized job view for persistent back-ends.
//!
//! The wire form is a UTF-8 JSON object `{id, status, input, output}`.
//! Status strings come from the closed `JobStatus` set; anything else
//! fails rehydration with `InvalidStatus`.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::job::{JobCell, JobResult, JobStatus};

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct JobSnapshot<T, R> {
    pub id: String,
    pub status: String,
    pub input: T,
    #[serde(default = "default_output", skip_serializing_if = "Option::is_none")]
    pub output: Option<JobResult<R>>,
}

fn default_output<R>() -> Option<JobResult<R>> {
    None
}

impl<T, R> JobCell<T, R>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Serializes the job into its wire form.
    pub(crate) fn to_snapshot_bytes(&self) -> Result<Vec<u8>, QueueError> {
        let view = JobSnapshot {
            id: self.id().to_string(),
            status: self.status().as_str().to_string(),
            input: self.data(),
            output: self.output_clone(),
        };
        Ok(serde_json::to_vec(&view)?)
    }

    /// Rehydrates a job from its wire form.
    ///
    /// # Errors
    ///
    /// `SerializationFailed` for malformed payloads, `InvalidStatus` for
    /// status strings outside the known set.
    pub(crate) fn from_snapshot_bytes(bytes: &[u8]) -> Result<Arc<Self>, QueueError> {
        let view: JobSnapshot<T, R> = serde_json::from_slice(bytes)?;
        let status = JobStatus::parse(&view.status)?;
        Ok(JobCell::rehydrated(view.id, view.input, status, view.output))
    }
}
