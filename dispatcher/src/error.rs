use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::{ErrorBody, JobId, JobStatus, PipelineError};
use thiserror::Error;
use tracing::error;

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Denied(String),

    /// Create collision; the payload names the job (or the resource for
    /// upstream 409s).
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("job {id} cannot move from {from} to {to}")]
    StateRegression {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// Compare-and-set lost: someone else moved the job first.
    #[error("job {id} is {actual}, expected {expected}")]
    StaleStatus {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("submission of job {id} failed: {reason}")]
    SubmissionFailed { id: JobId, reason: String },

    /// Retriable downstream failure (5xx, timeouts, 429).
    #[error("upstream unavailable: {0}")]
    TransientUpstream(String),

    /// Non-retriable downstream failure.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Denied(_) => "DENIED",
            Self::AlreadyExists(_) => "CONFLICT",
            Self::StateRegression { .. } => "STATE_REGRESSION",
            Self::StaleStatus { .. } => "STALE_STATUS",
            Self::SubmissionFailed { .. } => "SUBMISSION_FAILED",
            Self::TransientUpstream(_) => "TRANSIENT_UPSTREAM",
            Self::Upstream(_) => "UPSTREAM",
            Self::Config(_) => "FATAL",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Denied(_) => StatusCode::FORBIDDEN,
            Self::AlreadyExists(_) | Self::StateRegression { .. } | Self::StaleStatus { .. } => {
                StatusCode::CONFLICT
            }
            Self::TransientUpstream(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::SubmissionFailed { .. } | Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether redelivery may succeed where this attempt did not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientUpstream(_))
    }

    /// Classifies a failed HTTP exchange with a Google API.
    pub fn from_status(status: reqwest::StatusCode, context: &str, body: &str) -> Self {
        let msg = format!("{context}: {status} {}", body.trim());
        if status == reqwest::StatusCode::NOT_FOUND {
            Self::NotFound(context.to_string())
        } else if status == reqwest::StatusCode::CONFLICT {
            Self::AlreadyExists(context.to_string())
        } else if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            Self::TransientUpstream(msg)
        } else {
            Self::Upstream(msg)
        }
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Self::TransientUpstream(e.to_string())
        } else {
            Self::Upstream(e.to_string())
        }
    }
}

impl From<PipelineError> for DispatchError {
    fn from(e: PipelineError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(e: serde_json::Error) -> Self {
        Self::Upstream(format!("unexpected payload: {e}"))
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.code(), "{}", self);
        }
        let body = ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
