use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobInput, JobKind, JobStatus};

/* --------- Submission --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub kind: JobKind,
    pub owner: String,
    #[serde(default)]
    pub input: JobInput,
    /// Overrides the configured container tag for this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_version: Option<String>,
    /// Skip the dedup lookup and always start a new run.
    #[serde(default)]
    pub no_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub deduped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTaskResponse {
    pub operation_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListJobsQuery {
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<JobKind>,
}

/* --------- Results --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultFile {
    pub name: String,
    pub size: u64,
    pub content_type: String,
    /// Signed, time limited download URL.
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: JobId,
    pub status: JobStatus,
    pub files: Vec<ResultFile>,
    pub expires_at: DateTime<Utc>,
}

/* --------- Misc --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_commit: String,
}

/// Rendered completion message returned by `/job-finish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub text: String,
    pub html: String,
}

/// Body of every error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}
