pub mod api;
pub mod canonical;
pub mod job;
pub mod operation;
pub mod paths;
pub mod pipeline;
pub mod pubsub;
pub mod task;
pub mod tsv;

pub use api::{
    CompletionMessage, ErrorBody, JobResults, ListJobsQuery, ResultFile, StartTaskResponse,
    SubmitJobRequest, SubmitJobResponse, VersionInfo,
};
pub use canonical::{canonical_bytes, canonicalize, content_hash};
pub use job::{ContainerRef, Job, JobId, JobInput, JobKind, JobStatus, ParseKindError, ParseStatusError};
pub use operation::{Operation, OperationError};
pub use pipeline::{BatchRequest, FactoryConfig, PipelineError};
pub use pubsub::PushEnvelope;
pub use task::{QueueTask, StartTaskPayload};
pub use tsv::{TraitTable, TsvError};
