use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::job::{Job, JobKind};
use crate::paths;

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
pub const BOOT_IMAGE: &str = "projects/cos-cloud/global/images/family/cos-stable";

/// Input field holding the object-store pointer of an uploaded input table.
pub const DATA_BLOB_FIELD: &str = "data_blob";

#[derive(Debug, Error, PartialEq)]
pub enum PipelineError {
    #[error("invalid job {job_id}: {reason}")]
    InvalidJob { job_id: String, reason: String },

    #[error("jobs of kind {0} are not run on batch compute")]
    Unschedulable(JobKind),
}

/* --------- Request --------- */

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAccount {
    pub email: String,
    pub scopes: Vec<String>,
}

/// Provider-agnostic description of one container run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub image_uri: String,
    pub command: Vec<String>,
    /// Name of the running container (DNS label), not the image.
    pub container_name: String,
    pub environment: BTreeMap<String, String>,
    pub service_account: ServiceAccount,
    pub machine_type: String,
    pub preemptible: bool,
    pub boot_disk_size_gb: u32,
    pub boot_image: String,
    pub zones: Vec<String>,
    pub timeout_secs: u64,
    /// Full topic path the provider publishes completion events to.
    pub pubsub_topic: String,
    pub enable_monitoring: bool,
}

/// Deployment values the policy table may reference.
#[derive(Debug, Clone, PartialEq)]
pub struct FactoryConfig {
    pub project_id: String,
    pub zone: String,
    pub service_account_email: String,
    pub pubsub_topic: String,
    pub data_bucket: String,
    pub work_bucket: String,
}

/* --------- Policy table --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaField {
    JobId,
    Owner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    ProjectId,
    Zone,
    ServiceAccountEmail,
    DataBucket,
    /// `{kind}/{id}/data.tsv`
    InputBlob,
    /// `{kind}/{id}/result.tsv`
    ResultBlob,
    /// `gs://{data}/{kind}/{id}/data.tsv`
    InputUri,
    /// `gs://{data}/{kind}/{id}`
    OutputDir,
    /// `gs://{work}/{data_hash}`
    WorkDir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvSource {
    Input(&'static str),
    Meta(MetaField),
    Config(ConfigField),
}

#[derive(Debug, Clone, Copy)]
pub struct EnvVar {
    pub name: &'static str,
    pub source: EnvSource,
    pub required: bool,
}

const fn required(name: &'static str, source: EnvSource) -> EnvVar {
    EnvVar { name, source, required: true }
}

const fn optional(name: &'static str, source: EnvSource) -> EnvVar {
    EnvVar { name, source, required: false }
}

#[derive(Debug, Clone, Copy)]
pub enum Condition {
    ContainerVersion(&'static str),
    InputEquals(&'static str, &'static str),
}

/// Replaces parts of a policy when its condition holds. First match wins.
#[derive(Debug, Clone, Copy)]
pub struct PolicyOverride {
    pub when: Condition,
    pub command: Option<&'static [&'static str]>,
    pub machine_type: Option<&'static str>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelinePolicy {
    pub kind: JobKind,
    pub command: &'static [&'static str],
    pub env: &'static [EnvVar],
    pub machine_type: &'static str,
    pub preemptible: bool,
    pub timeout_secs: u64,
    pub boot_disk_size_gb: u32,
    pub scopes: &'static [&'static str],
    /// The container writes `{kind}/{id}/result.tsv`; a run without it is a failure.
    pub result_blob: bool,
    pub overrides: &'static [PolicyOverride],
}

const GCP_ENV: [EnvVar; 3] = [
    required("GOOGLE_SERVICE_ACCOUNT_EMAIL", EnvSource::Config(ConfigField::ServiceAccountEmail)),
    required("GOOGLE_PROJECT", EnvSource::Config(ConfigField::ProjectId)),
    required("GOOGLE_ZONE", EnvSource::Config(ConfigField::Zone)),
];

const HERITABILITY_ENV: &[EnvVar] = &[
    GCP_ENV[0],
    GCP_ENV[1],
    GCP_ENV[2],
    required("TRAIT_FILE", EnvSource::Config(ConfigField::InputUri)),
    required("WORK_DIR", EnvSource::Config(ConfigField::WorkDir)),
    required("OUTPUT_DIR", EnvSource::Config(ConfigField::OutputDir)),
    required("DATA_HASH", EnvSource::Input("data_hash")),
    required("TRAIT", EnvSource::Input("trait")),
    optional("SPECIES", EnvSource::Input("species")),
    optional("VCF_VERSION", EnvSource::Input("vcf_version")),
    required("DATA_BUCKET", EnvSource::Config(ConfigField::DataBucket)),
    required("DATA_BLOB_PATH", EnvSource::Config(ConfigField::InputBlob)),
];

const INDEL_PRIMER_ENV: &[EnvVar] = &[
    required("SPECIES", EnvSource::Input("species")),
    optional("RELEASE", EnvSource::Input("release")),
    required("INDEL_STRAIN_1", EnvSource::Input("strain_1")),
    required("INDEL_STRAIN_2", EnvSource::Input("strain_2")),
    required("INDEL_SITE", EnvSource::Input("site")),
    required("RESULT_BUCKET", EnvSource::Config(ConfigField::DataBucket)),
    required("RESULT_BLOB", EnvSource::Config(ConfigField::ResultBlob)),
];

const NEMASCAN_ENV: &[EnvVar] = &[
    GCP_ENV[0],
    GCP_ENV[1],
    GCP_ENV[2],
    required("TRAIT_FILE", EnvSource::Config(ConfigField::InputUri)),
    required("WORK_DIR", EnvSource::Config(ConfigField::WorkDir)),
    required("OUTPUT_DIR", EnvSource::Config(ConfigField::OutputDir)),
    required("SPECIES", EnvSource::Input("species")),
    optional("VCF_VERSION", EnvSource::Input("vcf_version")),
    required("EMAIL", EnvSource::Meta(MetaField::Owner)),
];

const DB_OPERATION_ENV: &[EnvVar] = &[
    required("DATABASE_OPERATION", EnvSource::Input("db_operation")),
    optional("SPECIES_LIST", EnvSource::Input("species_list")),
    required("EMAIL", EnvSource::Meta(MetaField::Owner)),
    required("OPERATION_ID", EnvSource::Meta(MetaField::JobId)),
    required("TASK_ID", EnvSource::Meta(MetaField::JobId)),
];

const GENE_BROWSER_TRACKS_ENV: &[EnvVar] = &[
    required("WORMBASE_VERSION", EnvSource::Input("wormbase_version")),
    required("DATA_BUCKET", EnvSource::Config(ConfigField::DataBucket)),
];

pub static POLICIES: [PipelinePolicy; 5] = [
    PipelinePolicy {
        kind: JobKind::Heritability,
        command: &["./heritability-nxf.sh"],
        env: HERITABILITY_ENV,
        machine_type: "n1-standard-1",
        preemptible: false,
        timeout_secs: 9_000,
        boot_disk_size_gb: 10,
        scopes: &[CLOUD_PLATFORM_SCOPE],
        result_blob: true,
        // v0.1a predates the nextflow wrapper
        overrides: &[PolicyOverride {
            when: Condition::ContainerVersion("v0.1a"),
            command: Some(&["python", "/h2/main.py"]),
            machine_type: None,
            timeout_secs: None,
        }],
    },
    PipelinePolicy {
        kind: JobKind::IndelPrimer,
        command: &["python", "/indel_primer/main.py"],
        env: INDEL_PRIMER_ENV,
        machine_type: "n1-standard-1",
        preemptible: false,
        timeout_secs: 3_600,
        boot_disk_size_gb: 20,
        scopes: &[CLOUD_PLATFORM_SCOPE],
        result_blob: true,
        overrides: &[],
    },
    PipelinePolicy {
        kind: JobKind::NemascanMapping,
        command: &["nemascan-nxf.sh"],
        env: NEMASCAN_ENV,
        machine_type: "n1-standard-1",
        preemptible: false,
        timeout_secs: 86_400,
        boot_disk_size_gb: 100,
        scopes: &[CLOUD_PLATFORM_SCOPE],
        result_blob: false,
        overrides: &[],
    },
    PipelinePolicy {
        kind: JobKind::DbOperation,
        command: &["/db_operations/run.sh"],
        env: DB_OPERATION_ENV,
        machine_type: "n1-standard-4",
        preemptible: false,
        timeout_secs: 86_400,
        boot_disk_size_gb: 50,
        scopes: &[CLOUD_PLATFORM_SCOPE],
        result_blob: false,
        overrides: &[PolicyOverride {
            when: Condition::InputEquals("db_operation", "TEST_ECHO"),
            command: None,
            machine_type: Some("n1-standard-1"),
            timeout_secs: Some(600),
        }],
    },
    PipelinePolicy {
        kind: JobKind::GeneBrowserTracks,
        command: &["/gene_browser_tracks/run.sh"],
        env: GENE_BROWSER_TRACKS_ENV,
        machine_type: "n1-standard-4",
        preemptible: false,
        timeout_secs: 3_600,
        boot_disk_size_gb: 50,
        scopes: &[CLOUD_PLATFORM_SCOPE],
        result_blob: false,
        overrides: &[],
    },
];

/// Policy for a kind; `None` for kinds computed outside batch compute.
pub fn policy(kind: JobKind) -> Option<&'static PipelinePolicy> {
    POLICIES.iter().find(|p| p.kind == kind)
}

pub fn is_schedulable(kind: JobKind) -> bool {
    policy(kind).is_some()
}

/* --------- Factory --------- */

/// Translates a job into a batch request. Pure: same job and config, same request.
pub fn build(job: &Job, cfg: &FactoryConfig) -> Result<BatchRequest, PipelineError> {
    let policy = policy(job.kind).ok_or(PipelineError::Unschedulable(job.kind))?;
    let invalid = |reason: String| PipelineError::InvalidJob {
        job_id: job.id.clone(),
        reason,
    };

    if job.id.is_empty() {
        return Err(invalid("empty job id".into()));
    }
    if job.container.name.is_empty() || job.container.registry.is_empty() {
        return Err(invalid("container coordinates are incomplete".into()));
    }

    let active = policy.overrides.iter().find(|o| matches(o.when, job));

    let command = active
        .and_then(|o| o.command)
        .unwrap_or(policy.command)
        .iter()
        .map(|s| s.to_string())
        .collect();
    let machine_type = active
        .and_then(|o| o.machine_type)
        .unwrap_or(policy.machine_type)
        .to_string();
    let timeout_secs = active
        .and_then(|o| o.timeout_secs)
        .unwrap_or(policy.timeout_secs);

    let mut environment = BTreeMap::new();
    for var in policy.env {
        match resolve(var.source, job, cfg).map_err(|r| invalid(format!("{}: {}", var.name, r)))? {
            Some(value) => {
                environment.insert(var.name.to_string(), value);
            }
            None if var.required => {
                return Err(invalid(format!("missing required value for {}", var.name)));
            }
            None => {}
        }
    }

    Ok(BatchRequest {
        image_uri: job.container.uri(),
        command,
        container_name: container_name(job),
        environment,
        service_account: ServiceAccount {
            email: cfg.service_account_email.clone(),
            scopes: policy.scopes.iter().map(|s| s.to_string()).collect(),
        },
        machine_type,
        preemptible: policy.preemptible,
        boot_disk_size_gb: policy.boot_disk_size_gb,
        boot_image: BOOT_IMAGE.to_string(),
        zones: vec![cfg.zone.clone()],
        timeout_secs,
        pubsub_topic: cfg.pubsub_topic.clone(),
        enable_monitoring: true,
    })
}

/// `{kind}-{id}` as a DNS label: lowercase, dashes, at most 63 chars.
pub fn container_name(job: &Job) -> String {
    let mut name: String = format!("{}-{}", job.kind, job.id)
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    name.truncate(63);
    name.trim_end_matches('-').to_string()
}

fn matches(cond: Condition, job: &Job) -> bool {
    match cond {
        Condition::ContainerVersion(v) => job.container.version == v,
        Condition::InputEquals(field, v) => job.input_str(field) == Some(v),
    }
}

fn resolve(source: EnvSource, job: &Job, cfg: &FactoryConfig) -> Result<Option<String>, String> {
    let value = match source {
        EnvSource::Input(field) => return input_value(job.input.get(field)),
        EnvSource::Meta(field) => match field {
            MetaField::JobId => job.id.clone(),
            MetaField::Owner => job.owner.clone(),
        },
        EnvSource::Config(field) => match field {
            ConfigField::ProjectId => cfg.project_id.clone(),
            ConfigField::Zone => cfg.zone.clone(),
            ConfigField::ServiceAccountEmail => cfg.service_account_email.clone(),
            ConfigField::DataBucket => cfg.data_bucket.clone(),
            ConfigField::InputBlob => input_blob(job),
            ConfigField::ResultBlob => paths::result_path(job.kind, &job.id),
            ConfigField::InputUri => paths::gs_uri(&cfg.data_bucket, &input_blob(job)),
            ConfigField::OutputDir => paths::gs_uri(
                &cfg.data_bucket,
                paths::job_prefix(job.kind, &job.id).trim_end_matches('/'),
            ),
            ConfigField::WorkDir => paths::gs_uri(&cfg.work_bucket, &job.data_hash),
        },
    };
    Ok(Some(value).filter(|v| !v.is_empty()))
}

fn input_blob(job: &Job) -> String {
    job.input_str(DATA_BLOB_FIELD)
        .map(str::to_string)
        .unwrap_or_else(|| paths::input_path(job.kind, &job.id))
}

// Lists of primitives are joined with ';', the separator the containers split on.
fn input_value(value: Option<&Value>) -> Result<Option<String>, String> {
    let Some(value) = value else {
        return Ok(None);
    };
    let s = match value {
        Value::Null => return Ok(None),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => parts.push(s.clone()),
                    Value::Number(n) => parts.push(n.to_string()),
                    _ => return Err("list values must be strings or numbers".into()),
                }
            }
            parts.join(";")
        }
        Value::Object(_) => return Err("nested objects are not supported".into()),
    };
    Ok(Some(s).filter(|v| !v.is_empty()))
}
