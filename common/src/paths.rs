// Object-store layout shared by the dispatcher and the pipeline containers.
// These paths are read by already-deployed images; do not change them.

use crate::job::JobKind;

pub const INPUT_FILE: &str = "data.tsv";
pub const RESULT_FILE: &str = "result.tsv";
pub const LOG_FILE: &str = "output";

pub fn job_prefix(kind: JobKind, job_id: &str) -> String {
    format!("{}/{}/", kind, job_id)
}

/// `{kind}/{job_id}/data.tsv`
pub fn input_path(kind: JobKind, job_id: &str) -> String {
    format!("{}{}", job_prefix(kind, job_id), INPUT_FILE)
}

/// `{kind}/{job_id}/result.tsv`
pub fn result_path(kind: JobKind, job_id: &str) -> String {
    format!("{}{}", job_prefix(kind, job_id), RESULT_FILE)
}

/// `logs/{kind}/{job_id}/output`
pub fn log_path(kind: JobKind, job_id: &str) -> String {
    format!("logs/{}/{}/{}", kind, job_id, LOG_FILE)
}

pub fn gs_uri(bucket: &str, path: &str) -> String {
    format!("gs://{}/{}", bucket, path.trim_start_matches('/'))
}
