use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobStatus;

/// Batch-compute provider's handle to a run. Read-only on our side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Full resource path, e.g. `projects/1/locations/us-central1/operations/123`.
    pub name: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

impl Operation {
    /// Status the provider's view dictates for the job.
    /// A known, unfinished operation counts as RUNNING.
    pub fn observed_status(&self) -> JobStatus {
        match (self.done, &self.error) {
            (true, Some(_)) => JobStatus::Error,
            (true, None) => JobStatus::Complete,
            (false, _) => JobStatus::Running,
        }
    }

    pub fn error_summary(&self) -> Option<String> {
        self.error.as_ref().map(|e| {
            if e.message.is_empty() {
                format!("operation failed with code {}", e.code)
            } else {
                format!("{} (code {})", e.message, e.code)
            }
        })
    }
}
