use common::{ContainerRef, FactoryConfig, JobKind};
use std::{collections::HashMap, str::FromStr, time::Duration};

use crate::error::{DispatchError, Result};

/// Upper bound for signed URL lifetimes (V4 signing limit).
pub const MAX_SIGNED_URL_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Gcp,
    Memory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineEnv {
    pub container_name: String,
    pub container_version: String,
    pub queue_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotifierSettings {
    pub lookup_retries: u32,
    pub lookup_delay: Duration,
    pub webhook_max_attempts: u32,
    pub webhook_base_delay: Duration,
    pub webhook_max_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub backend: Backend,

    pub project_id: String,
    pub region: String,
    pub zone: String,
    pub service_account_name: String,
    pub pubsub_topic_name: String,
    pub webhook_token: String,

    pub container_registry: String,
    pub pipelines: HashMap<JobKind, PipelineEnv>,

    pub data_bucket: String,
    pub work_bucket: String,
    pub logs_bucket: String,
    pub site_base_url: String,
    pub task_service_url: String,

    pub inline_input_limit: usize,
    pub record_retries: u32,
    pub record_retry_delay: Duration,
    pub notifier: NotifierSettings,
    pub status_task_delay: Duration,
    pub monitor_interval: Duration,
    pub monitor_stale_after: Duration,
    pub signed_url_ttl: Duration,

    pub git_commit: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Builds the config from any key lookup. Every missing required key is
    /// reported in a single error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut missing: Vec<String> = Vec::new();
        let mut required = |k: &str| {
            get(k).unwrap_or_else(|| {
                missing.push(k.to_string());
                String::new()
            })
        };

        // 1) required globals
        let project_id = required("CLOUD_PROJECT_ID");
        let region = required("CLOUD_REGION");
        let service_account_name = required("SERVICE_ACCOUNT_NAME");
        let pubsub_topic_name = required("PUBSUB_TOPIC_NAME");
        let webhook_token = required("SITE_WEBHOOK_ACCESS_TOKEN");

        // 2) per pipeline
        let mut pipelines = HashMap::new();
        for kind in JobKind::ALL {
            let p = kind.env_prefix();
            pipelines.insert(
                kind,
                PipelineEnv {
                    container_name: required(&format!("{p}_CONTAINER_NAME")),
                    container_version: required(&format!("{p}_CONTAINER_VERSION")),
                    queue_name: required(&format!("{p}_TASK_QUEUE_NAME")),
                },
            );
        }

        if !missing.is_empty() {
            return Err(DispatchError::Config(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )));
        }

        // 3) optional
        let port = parse_or(&get, "PORT", 8080u16)?;
        let backend = match get("DISPATCHER_BACKEND").as_deref() {
            None | Some("gcp") => Backend::Gcp,
            Some("memory") => Backend::Memory,
            Some(other) => {
                return Err(DispatchError::Config(format!(
                    "DISPATCHER_BACKEND must be gcp or memory, got {other}"
                )))
            }
        };
        let zone = get("CLOUD_ZONE").unwrap_or_else(|| format!("{region}-a"));
        let local_url = format!("http://localhost:{port}");

        let signed_url_ttl = Duration::from_secs(parse_or(&get, "SIGNED_URL_TTL_SECS", 3600u64)?);
        if signed_url_ttl.is_zero() || signed_url_ttl > MAX_SIGNED_URL_TTL {
            return Err(DispatchError::Config(
                "SIGNED_URL_TTL_SECS must be between 1 and 604800".into(),
            ));
        }

        let mut queues: HashMap<&str, JobKind> = HashMap::new();
        for (kind, env) in &pipelines {
            if let Some(other) = queues.insert(env.queue_name.as_str(), *kind) {
                return Err(DispatchError::Config(format!(
                    "task queue {} is shared by {} and {}",
                    env.queue_name, other, kind
                )));
            }
        }

        let data_bucket = get("DATA_BUCKET_NAME").unwrap_or_else(|| format!("{project_id}-data"));

        Ok(Self {
            port,
            backend,
            logs_bucket: get("ETL_LOGS_BUCKET_NAME").unwrap_or_else(|| data_bucket.clone()),
            data_bucket,
            work_bucket: get("WORK_BUCKET_NAME").unwrap_or_else(|| format!("{project_id}-work")),
            project_id,
            region,
            zone,
            service_account_name,
            pubsub_topic_name,
            webhook_token,
            container_registry: get("CONTAINER_REGISTRY").unwrap_or_else(|| "docker.io/caendr".into()),
            pipelines,
            site_base_url: get("SITE_BASE_URL").unwrap_or_else(|| local_url.clone()),
            task_service_url: get("TASK_SERVICE_URL").unwrap_or(local_url),
            inline_input_limit: parse_or(&get, "INLINE_INPUT_LIMIT_BYTES", 4096usize)?,
            record_retries: parse_or(&get, "REGISTRY_WRITE_RETRIES", 3u32)?,
            record_retry_delay: Duration::from_millis(parse_or(&get, "REGISTRY_RETRY_DELAY_MS", 200u64)?),
            notifier: NotifierSettings {
                lookup_retries: parse_or(&get, "NOTIFIER_LOOKUP_RETRIES", 3u32)?,
                lookup_delay: Duration::from_millis(parse_or(&get, "NOTIFIER_LOOKUP_DELAY_MS", 500u64)?),
                webhook_max_attempts: parse_or(&get, "WEBHOOK_MAX_ATTEMPTS", 5u32)?.max(1),
                webhook_base_delay: Duration::from_millis(parse_or(&get, "WEBHOOK_BASE_DELAY_MS", 250u64)?),
                webhook_max_delay: Duration::from_millis(parse_or(&get, "WEBHOOK_MAX_DELAY_MS", 8000u64)?),
            },
            status_task_delay: Duration::from_secs(parse_or(&get, "STATUS_TASK_DELAY_SECS", 900u64)?),
            monitor_interval: Duration::from_secs(parse_or(&get, "MONITOR_INTERVAL_SECS", 300u64)?),
            monitor_stale_after: Duration::from_secs(parse_or(&get, "MONITOR_STALE_AFTER_SECS", 1800u64)?),
            signed_url_ttl,
            git_commit: option_env!("GIT_COMMIT").unwrap_or("unknown").to_string(),
        })
    }

    pub fn service_account_email(&self) -> String {
        format!("{}@{}.iam.gserviceaccount.com", self.service_account_name, self.project_id)
    }

    pub fn pubsub_topic(&self) -> String {
        format!("projects/{}/topics/{}", self.project_id, self.pubsub_topic_name)
    }

    pub fn queue_for(&self, kind: JobKind) -> Option<&str> {
        self.pipelines.get(&kind).map(|p| p.queue_name.as_str())
    }

    /// Queue → kind routing used by the task endpoints.
    pub fn kind_for_queue(&self, queue: &str) -> Option<JobKind> {
        self.pipelines
            .iter()
            .find(|(_, p)| p.queue_name == queue)
            .map(|(k, _)| *k)
    }

    pub fn container_for(&self, kind: JobKind, version: Option<&str>) -> Option<ContainerRef> {
        self.pipelines.get(&kind).map(|p| ContainerRef {
            registry: self.container_registry.clone(),
            name: p.container_name.clone(),
            version: version.unwrap_or(&p.container_version).to_string(),
        })
    }

    pub fn factory_config(&self) -> FactoryConfig {
        FactoryConfig {
            project_id: self.project_id.clone(),
            zone: self.zone.clone(),
            service_account_email: self.service_account_email(),
            pubsub_topic: self.pubsub_topic(),
            data_bucket: self.data_bucket.clone(),
            work_bucket: self.work_bucket.clone(),
        }
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| DispatchError::Config(format!("{key} has an invalid value `{raw}`"))),
    }
}

#[cfg(test)]
pub(crate) fn test_vars() -> HashMap<String, String> {
    let mut vars: HashMap<String, String> = [
        ("CLOUD_PROJECT_ID", "caendr-dev"),
        ("CLOUD_REGION", "us-central1"),
        ("SERVICE_ACCOUNT_NAME", "pipeline"),
        ("PUBSUB_TOPIC_NAME", "pipeline-status"),
        ("SITE_WEBHOOK_ACCESS_TOKEN", "s3cret"),
        ("DISPATCHER_BACKEND", "memory"),
        ("REGISTRY_RETRY_DELAY_MS", "1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    for kind in JobKind::ALL {
        let p = kind.env_prefix();
        vars.insert(format!("{p}_CONTAINER_NAME"), kind.as_str().to_string());
        vars.insert(format!("{p}_CONTAINER_VERSION"), "v1".to_string());
        vars.insert(format!("{p}_TASK_QUEUE_NAME"), format!("{}-queue", kind.as_str().replace('_', "-")));
    }
    vars
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    let vars = test_vars();
    match Config::from_lookup(|k| vars.get(k).cloned()) {
        Ok(cfg) => cfg,
        Err(e) => panic!("test config: {e}"),
    }
}
