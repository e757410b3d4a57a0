use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub type JobId = String;

/// Submission parameters as received: string keys to primitive values.
pub type JobInput = Map<String, Value>;

/* --------- Kinds --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Heritability,
    IndelPrimer,
    NemascanMapping,
    DbOperation,
    GeneBrowserTracks,
    PhenotypeReport,
}

#[derive(Debug, Error)]
#[error("unknown job kind `{0}`")]
pub struct ParseKindError(pub String);

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::Heritability,
        JobKind::IndelPrimer,
        JobKind::NemascanMapping,
        JobKind::DbOperation,
        JobKind::GeneBrowserTracks,
        JobKind::PhenotypeReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Heritability => "heritability",
            JobKind::IndelPrimer => "indel_primer",
            JobKind::NemascanMapping => "nemascan_mapping",
            JobKind::DbOperation => "db_operation",
            JobKind::GeneBrowserTracks => "gene_browser_tracks",
            JobKind::PhenotypeReport => "phenotype_report",
        }
    }

    /// Prefix of the per-pipeline environment variables
    /// (`{PREFIX}_CONTAINER_NAME`, `{PREFIX}_TASK_QUEUE_NAME`, ...).
    pub fn env_prefix(&self) -> &'static str {
        match self {
            JobKind::Heritability => "HERITABILITY",
            JobKind::IndelPrimer => "INDEL_PRIMER",
            JobKind::NemascanMapping => "NEMASCAN",
            JobKind::DbOperation => "DB_OPERATIONS",
            JobKind::GeneBrowserTracks => "GENE_BROWSER_TRACKS",
            JobKind::PhenotypeReport => "PHENOTYPE_REPORT",
        }
    }

    /// Human readable name used in completion messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            JobKind::Heritability => "Heritability Report",
            JobKind::IndelPrimer => "Pairwise Indel Finder",
            JobKind::NemascanMapping => "Genetic Mapping",
            JobKind::DbOperation => "Database Operation",
            JobKind::GeneBrowserTracks => "Gene Browser Tracks",
            JobKind::PhenotypeReport => "Phenotype Report",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ParseKindError(s.to_string()))
    }
}

/* --------- Status --------- */

/// Lifecycle of a job. Declaration order is the forward order:
/// `CREATED < SUBMITTED < RUNNING < ERROR < COMPLETE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Submitted,
    Running,
    Error,
    Complete,
}

#[derive(Debug, Error)]
#[error("unknown job status `{0}`")]
pub struct ParseStatusError(pub String);

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Running => "RUNNING",
            JobStatus::Error => "ERROR",
            JobStatus::Complete => "COMPLETE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    // aristas validas del ciclo de vida; terminales no se mueven
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (*self, next),
            (Created, Submitted)
                | (Created, Error)
                | (Submitted, Running)
                | (Submitted, Error)
                | (Submitted, Complete)
                | (Running, Error)
                | (Running, Complete)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(JobStatus::Created),
            "SUBMITTED" => Ok(JobStatus::Submitted),
            "RUNNING" => Ok(JobStatus::Running),
            "ERROR" => Ok(JobStatus::Error),
            "COMPLETE" => Ok(JobStatus::Complete),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/* --------- Job record --------- */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub registry: String,
    pub name: String,
    pub version: String,
}

impl ContainerRef {
    pub fn uri(&self) -> String {
        if self.version.is_empty() {
            format!("{}/{}", self.registry, self.name)
        } else {
            format!("{}/{}:{}", self.registry, self.name, self.version)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub owner: String,

    /// 32 hex chars over the canonical input; `(kind, data_hash)` is the dedup key.
    pub data_hash: String,

    pub container: ContainerRef,
    pub input: JobInput,
    pub status: JobStatus,

    /// Backend operation name, set together with SUBMITTED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Set once the completion webhook accepted the terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notified_at: Option<DateTime<Utc>>,

    /// Last time reconciliation looked at the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        id: JobId,
        kind: JobKind,
        owner: impl Into<String>,
        data_hash: impl Into<String>,
        container: ContainerRef,
        input: JobInput,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            owner: owner.into(),
            data_hash: data_hash.into(),
            container,
            input,
            status: JobStatus::Created,
            operation_id: None,
            created_at: now,
            updated_at: now,
            error: None,
            notified_at: None,
            checked_at: None,
        }
    }

    pub fn new_id() -> JobId {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Terminal and not yet reported to the web tier.
    pub fn awaiting_notification(&self) -> bool {
        self.status.is_terminal() && self.notified_at.is_none()
    }

    /// Newest of `updated_at` and `checked_at`; sweeps go oldest first.
    pub fn last_checked(&self) -> DateTime<Utc> {
        self.checked_at.map_or(self.updated_at, |c| c.max(self.updated_at))
    }

    /// String view of an input field, ignoring non-string values.
    pub fn input_str(&self, field: &str) -> Option<&str> {
        self.input.get(field).and_then(Value::as_str)
    }
}
