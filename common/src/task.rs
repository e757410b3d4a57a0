use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{JobId, JobInput, JobKind};

/// Entry placed on the per-kind task queue after a successful submit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTask {
    pub job_id: JobId,
    pub kind: JobKind,
    pub operation_id: String,
}

impl QueueTask {
    /// Task name unique per job so the queue drops duplicate enqueues.
    pub fn name(&self) -> String {
        format!("{}-{}-status", self.kind, self.job_id)
    }
}

/// Body of `POST /task/start/{queue}`: `{id, kind, ...kind-specific fields}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTaskPayload {
    pub id: JobId,
    pub kind: JobKind,
    #[serde(flatten)]
    pub fields: JobInput,
}

impl StartTaskPayload {
    /// Owner identity as sent by the web tier (`email`, else `username`).
    pub fn owner(&self) -> Option<&str> {
        ["email", "username"]
            .iter()
            .find_map(|k| self.fields.get(*k).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
    }
}
