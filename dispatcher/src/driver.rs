use bytes::Bytes;
use common::{
    canonical::content_hash,
    paths,
    pipeline::{self, DATA_BLOB_FIELD},
    tsv, BatchRequest, FactoryConfig, Job, JobInput, JobKind, JobStatus, QueueTask,
    StartTaskPayload, SubmitJobRequest, SubmitJobResponse,
};
use serde_json::Value;
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

use crate::batch::BatchCompute;
use crate::config::Config;
use crate::error::{DispatchError, Result};
use crate::notifier::backoff;
use crate::registry::{JobRegistry, TransitionUpdate};
use crate::storage::ObjectStore;
use crate::queue::TaskQueue;

/// Input field carrying an inline TSV table.
pub const DATA_FIELD: &str = "data";
const TSV_CONTENT_TYPE: &str = "text/tab-separated-values";
const LOG_CONTENT_TYPE: &str = "text/plain";
const MAX_RECORD_DELAY: Duration = Duration::from_secs(5);

/// Result of an authoritative refresh.
#[derive(Debug, Clone)]
pub struct Refreshed {
    pub job: Job,
    /// This call moved the job into a terminal status.
    pub applied: bool,
}

/// Input after intake: what gets stored, and a table to upload first.
#[derive(Debug)]
struct StagedInput {
    input: JobInput,
    table: Option<Bytes>,
}

/// Submission path and job state machine.
pub struct Driver {
    config: Arc<Config>,
    factory: FactoryConfig,
    registry: Arc<dyn JobRegistry>,
    store: Arc<dyn ObjectStore>,
    batch: Arc<dyn BatchCompute>,
    queue: Arc<dyn TaskQueue>,
}

impl Driver {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<dyn JobRegistry>,
        store: Arc<dyn ObjectStore>,
        batch: Arc<dyn BatchCompute>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            factory: config.factory_config(),
            config,
            registry,
            store,
            batch,
            queue,
        }
    }

    pub fn registry(&self) -> &Arc<dyn JobRegistry> {
        &self.registry
    }

    /* ---------------- submit ---------------- */

    pub async fn submit_job(&self, req: SubmitJobRequest) -> Result<SubmitJobResponse> {
        let kind = req.kind;
        let owner = req.owner.trim().to_string();
        if owner.is_empty() {
            return Err(DispatchError::BadRequest("owner is required".into()));
        }
        if !pipeline::is_schedulable(kind) {
            return Err(DispatchError::BadRequest(format!("jobs of kind {kind} cannot be submitted")));
        }

        // 1) hash canonico del input tal como llega
        let input = with_derived_fields(kind, req.input)?;
        let hash = content_hash(&Value::Object(input.clone()));

        // 2) dedup
        if !req.no_cache {
            if let Some(prior) = self.registry.find_by_hash(kind, &hash).await? {
                if matches!(prior.status, JobStatus::Complete | JobStatus::Running) {
                    info!(job_id = %prior.id, kind = %kind, hash = %hash, "dedup hit");
                    return Ok(SubmitJobResponse {
                        job_id: prior.id,
                        status: prior.status,
                        deduped: true,
                    });
                }
            }
        }

        // 3) registro nuevo
        let id = Job::new_id();
        let container = self
            .config
            .container_for(kind, req.container_version.as_deref())
            .ok_or_else(|| DispatchError::BadRequest(format!("no container configured for {kind}")))?;
        let staged = self.stage_input(kind, &id, input);
        let job = Job::new(id, kind, owner, hash, container, staged.input);

        let job = self.launch(job, staged.table).await?;
        Ok(SubmitJobResponse {
            job_id: job.id,
            status: job.status,
            deduped: false,
        })
    }

    /// `POST /task/start/{queue}`: submit a job the web tier already named.
    /// Returns the operation name; repeated calls return the same one.
    pub async fn start_task(&self, queue: &str, payload: StartTaskPayload) -> Result<String> {
        let kind = self
            .config
            .kind_for_queue(queue)
            .ok_or_else(|| DispatchError::BadRequest(format!("unknown queue {queue}")))?;
        if payload.kind != kind {
            return Err(DispatchError::BadRequest(format!(
                "queue {queue} only accepts {kind} jobs, got {}",
                payload.kind
            )));
        }
        if !pipeline::is_schedulable(kind) {
            return Err(DispatchError::BadRequest(format!("jobs of kind {kind} cannot be submitted")));
        }

        let job = match self.registry.get(&payload.id).await {
            Ok(existing) => {
                if existing.kind != kind {
                    return Err(DispatchError::BadRequest(format!(
                        "job {} is a {} job",
                        existing.id, existing.kind
                    )));
                }
                match (existing.status, existing.operation_id.clone()) {
                    (JobStatus::Created, _) => self.resume(existing).await?,
                    (_, Some(op)) => {
                        debug!(job_id = %existing.id, operation = %op, "task start replayed");
                        return Ok(op);
                    }
                    (status, None) => {
                        return Err(DispatchError::BadRequest(format!(
                            "job {} is {} and was never submitted",
                            existing.id, status
                        )))
                    }
                }
            }
            Err(DispatchError::NotFound(_)) => {
                let owner = payload
                    .owner()
                    .ok_or_else(|| DispatchError::BadRequest("payload has no email or username".into()))?
                    .to_string();
                let version = payload
                    .fields
                    .get("container_version")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let mut fields = payload.fields;
                for k in ["email", "username", "container_version"] {
                    fields.remove(k);
                }
                let input = with_derived_fields(kind, fields)?;
                let hash = content_hash(&Value::Object(input.clone()));
                let container = self
                    .config
                    .container_for(kind, version.as_deref())
                    .ok_or_else(|| DispatchError::BadRequest(format!("no container configured for {kind}")))?;
                let staged = self.stage_input(kind, &payload.id, input);
                let job = Job::new(payload.id, kind, owner, hash, container, staged.input);
                self.launch(job, staged.table).await?
            }
            Err(e) => return Err(e),
        };

        job.operation_id
            .ok_or_else(|| DispatchError::Upstream(format!("job {} has no operation after submit", job.id)))
    }

    /// Validates, uploads inputs, creates the record and submits.
    async fn launch(&self, job: Job, table: Option<Bytes>) -> Result<Job> {
        // validar antes de escribir nada
        let request = pipeline::build(&job, &self.factory)?;

        if let Some(table) = table {
            let path = paths::input_path(job.kind, &job.id);
            self.store
                .put(&self.config.data_bucket, &path, table, TSV_CONTENT_TYPE)
                .await?;
            debug!(job_id = %job.id, path = %path, "input table uploaded");
        }

        self.registry.create(&job).await?;
        info!(job_id = %job.id, kind = %job.kind, owner = %job.owner, "job created");
        self.run(job, request).await
    }

    /// A CREATED record left behind by an earlier attempt.
    async fn resume(&self, job: Job) -> Result<Job> {
        let request = match pipeline::build(&job, &self.factory) {
            Ok(r) => r,
            Err(e) => {
                self.fail(&job, &e.to_string()).await;
                return Err(e.into());
            }
        };
        self.run(job, request).await
    }

    async fn run(&self, job: Job, request: BatchRequest) -> Result<Job> {
        // 4) enviar al proveedor
        let op = match self.batch.submit(&request).await {
            Ok(op) => op,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "batch submission failed");
                self.fail(&job, &e.to_string()).await;
                return Err(DispatchError::SubmissionFailed {
                    id: job.id,
                    reason: e.to_string(),
                });
            }
        };

        // 5) guardar la operacion junto con SUBMITTED; la operacion ya
        // existe, asi que el registro no puede quedar en CREATED
        let job = match self.record_submission(&job.id, &op.name).await {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %job.id, operation = %op.name, error = %e, "could not record submission");
                let reason = format!("submitted as {} but the record could not be updated: {e}", op.name);
                let update = TransitionUpdate {
                    operation_id: Some(op.name.clone()),
                    error: Some(reason.clone()),
                    expected: None,
                };
                if let Err(e) = self.registry.transition(&job.id, JobStatus::Error, update).await {
                    error!(job_id = %job.id, error = %e, "could not mark job as failed");
                }
                self.write_run_log(job.kind, &job.id, &reason).await;
                return Err(e);
            }
        };
        info!(job_id = %job.id, operation = %op.name, "job submitted");

        // 6) status task; si falla el job sigue SUBMITTED
        self.enqueue_status_task(&job).await;
        Ok(job)
    }

    async fn enqueue_status_task(&self, job: &Job) {
        let (Some(queue), Some(op)) = (self.config.queue_for(job.kind), job.operation_id.as_ref()) else {
            return;
        };
        let task = QueueTask {
            job_id: job.id.clone(),
            kind: job.kind,
            operation_id: op.clone(),
        };
        if let Err(e) = self.queue.enqueue(queue, &task).await {
            warn!(job_id = %job.id, queue = %queue, error = %e, "status task enqueue failed");
        }
    }

    async fn record_submission(&self, id: &str, op: &str) -> Result<Job> {
        let attempts = self.config.record_retries.max(1);
        let mut attempt = 0;
        loop {
            match self
                .registry
                .transition(id, JobStatus::Submitted, TransitionUpdate::operation(op))
                .await
            {
                Ok(job) => return Ok(job),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    warn!(job_id = %id, operation = %op, attempt = attempt + 1, error = %e, "submission write failed, retrying");
                    tokio::time::sleep(backoff(attempt, self.config.record_retry_delay, MAX_RECORD_DELAY)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fail(&self, job: &Job, reason: &str) {
        if let Err(e) = self
            .registry
            .transition(&job.id, JobStatus::Error, TransitionUpdate::error(reason))
            .await
        {
            error!(job_id = %job.id, error = %e, "could not mark job as failed");
        }
        self.write_run_log(job.kind, &job.id, reason).await;
    }

    /// Appends a line to `logs/{kind}/{id}/output`. Best effort.
    async fn write_run_log(&self, kind: JobKind, id: &str, message: &str) {
        let bucket = &self.config.logs_bucket;
        let path = paths::log_path(kind, id);
        let mut text = match self.store.get_bytes(bucket, &path).await {
            Ok(prior) => String::from_utf8_lossy(&prior).into_owned(),
            Err(DispatchError::NotFound(_)) => String::new(),
            Err(e) => {
                warn!(job_id = %id, path = %path, error = %e, "could not read run log");
                return;
            }
        };
        text.push_str(&format!("{} {}\n", Utc::now().to_rfc3339(), message));
        if let Err(e) = self.store.put(bucket, &path, Bytes::from(text), LOG_CONTENT_TYPE).await {
            warn!(job_id = %id, path = %path, error = %e, "could not write run log");
        }
    }

    /// Heritability tables: stored as a blob, kept inline only when small.
    fn stage_input(&self, kind: JobKind, id: &str, mut input: JobInput) -> StagedInput {
        let table = match input.get(DATA_FIELD).and_then(Value::as_str) {
            Some(data) if kind == JobKind::Heritability => Some(Bytes::from(data.to_string())),
            _ => None,
        };
        let Some(table) = table else {
            return StagedInput { input, table: None };
        };
        if table.len() > self.config.inline_input_limit {
            input.remove(DATA_FIELD);
        }
        input.insert(
            DATA_BLOB_FIELD.to_string(),
            Value::String(paths::input_path(kind, id)),
        );
        StagedInput {
            input,
            table: Some(table),
        }
    }

    /* ---------------- read / refresh ---------------- */

    /// Current record; does not contact the provider.
    pub async fn poll(&self, id: &str) -> Result<Job> {
        self.registry.get(id).await
    }

    pub async fn refresh(&self, id: &str) -> Result<Job> {
        Ok(self.refresh_outcome(id).await?.job)
    }

    /// Applies the provider's view of the operation. Idempotent; safe to
    /// race with the notifier.
    pub async fn refresh_outcome(&self, id: &str) -> Result<Refreshed> {
        let job = self.registry.get(id).await?;
        let Some(op_name) = job.operation_id.clone() else {
            return Ok(Refreshed { job, applied: false });
        };
        if job.status.is_terminal() {
            return Ok(Refreshed { job, applied: false });
        }

        let op = self.batch.get_operation(&op_name).await?;
        let mut observed = op.observed_status();
        let mut error = op.error_summary();

        if observed <= job.status {
            return Ok(Refreshed { job, applied: false });
        }

        // sin salida no hay COMPLETE
        if observed == JobStatus::Complete && expects_result(job.kind) {
            let path = paths::result_path(job.kind, &job.id);
            if !self.store.exists(&self.config.data_bucket, &path).await? {
                warn!(job_id = %job.id, path = %path, "operation finished without output");
                observed = JobStatus::Error;
                error = Some(format!("pipeline finished without writing {path}"));
            }
        }

        let update = TransitionUpdate {
            operation_id: None,
            error,
            expected: Some(job.status),
        };
        match self.registry.transition(&job.id, observed, update).await {
            Ok(next) => {
                info!(job_id = %next.id, operation = %op_name, from = %job.status, to = %next.status, "job status refreshed");
                if next.status == JobStatus::Error {
                    let reason = next.error.as_deref().unwrap_or("pipeline failed");
                    self.write_run_log(next.kind, &next.id, &format!("{op_name}: {reason}")).await;
                }
                Ok(Refreshed {
                    applied: next.status.is_terminal(),
                    job: next,
                })
            }
            // perdimos la carrera; el otro ya lo aplico
            Err(DispatchError::StaleStatus { .. }) | Err(DispatchError::StateRegression { .. }) => {
                let job = self.registry.get(id).await?;
                Ok(Refreshed { job, applied: false })
            }
            Err(e) => Err(e),
        }
    }
}

fn expects_result(kind: JobKind) -> bool {
    pipeline::policy(kind).is_some_and(|p| p.result_blob)
}

/// Fills fields derivable from an inline heritability table.
fn with_derived_fields(kind: JobKind, mut input: JobInput) -> Result<JobInput> {
    if kind != JobKind::Heritability {
        return Ok(input);
    }
    let Some(data) = input.get(DATA_FIELD).and_then(Value::as_str).map(str::to_string) else {
        return Ok(input);
    };
    let table = tsv::inspect_trait_table(&data).map_err(|e| DispatchError::BadRequest(e.to_string()))?;
    let missing = |input: &JobInput, k: &str| input.get(k).and_then(Value::as_str).map_or(true, str::is_empty);
    if missing(&input, "trait") {
        input.insert("trait".into(), Value::String(table.trait_name));
    }
    if missing(&input, "data_hash") {
        input.insert("data_hash".into(), Value::String(content_hash(&Value::String(data))));
    }
    Ok(input)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::batch::MemoryBatch;
    use crate::config::test_config;
    use crate::queue::MemoryQueue;
    use crate::registry::{JobFilter, MemoryRegistry};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub(crate) struct Harness {
        pub config: Arc<Config>,
        pub registry: Arc<MemoryRegistry>,
        pub store: Arc<MemoryStore>,
        pub batch: Arc<MemoryBatch>,
        pub queue: Arc<MemoryQueue>,
        pub driver: Arc<Driver>,
    }

    pub(crate) fn harness() -> Harness {
        let config = Arc::new(test_config());
        let registry = Arc::new(MemoryRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let batch = Arc::new(MemoryBatch::new());
        let queue = Arc::new(MemoryQueue::new());
        let driver = Arc::new(Driver::new(
            config.clone(),
            registry.clone(),
            store.clone(),
            batch.clone(),
            queue.clone(),
        ));
        Harness {
            config,
            registry,
            store,
            batch,
            queue,
            driver,
        }
    }

    pub(crate) fn heritability_request() -> SubmitJobRequest {
        let input = json!({"trait": "Healthspan", "data_hash": "abc123"});
        SubmitJobRequest {
            kind: JobKind::Heritability,
            owner: "alice@example.org".into(),
            input: input.as_object().cloned().unwrap_or_default(),
            container_version: None,
            no_cache: false,
        }
    }

    #[tokio::test]
    async fn happy_path_submits_once_and_enqueues() {
        let h = harness();
        let resp = h.driver.submit_job(heritability_request()).await.unwrap();
        assert_eq!(resp.status, JobStatus::Submitted);
        assert!(!resp.deduped);

        let submitted = h.batch.submitted().await;
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].environment["DATA_HASH"], "abc123");

        let job = h.driver.poll(&resp.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Submitted);
        assert_eq!(job.operation_id.as_deref(), Some("op/1"));

        let tasks = h.queue.tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].0, "heritability-queue");
        assert_eq!(tasks[0].1.job_id, resp.job_id);

        // find_by_hash returns the job with the input hash
        let input = Value::Object(heritability_request().input);
        let found = h
            .registry
            .find_by_hash(JobKind::Heritability, &content_hash(&input))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, resp.job_id);
    }

    #[tokio::test]
    async fn running_job_is_deduplicated() {
        let h = harness();
        let first = h.driver.submit_job(heritability_request()).await.unwrap();
        h.driver.refresh(&first.job_id).await.unwrap();

        let mut again = heritability_request();
        // key order does not matter
        again.input = serde_json::from_str(r#"{"data_hash":"abc123","trait":"Healthspan"}"#).unwrap();
        let second = h.driver.submit_job(again).await.unwrap();

        assert_eq!(second.job_id, first.job_id);
        assert_eq!(second.status, JobStatus::Running);
        assert!(second.deduped);
        assert_eq!(h.batch.submitted().await.len(), 1);
    }

    #[tokio::test]
    async fn submitted_job_is_not_a_dedup_hit() {
        let h = harness();
        let first = h.driver.submit_job(heritability_request()).await.unwrap();
        let second = h.driver.submit_job(heritability_request()).await.unwrap();
        assert_ne!(first.job_id, second.job_id);
        assert_eq!(h.batch.submitted().await.len(), 2);
    }

    #[tokio::test]
    async fn no_cache_skips_dedup() {
        let h = harness();
        let first = h.driver.submit_job(heritability_request()).await.unwrap();
        h.driver.refresh(&first.job_id).await.unwrap();
        let mut again = heritability_request();
        again.no_cache = true;
        let second = h.driver.submit_job(again).await.unwrap();
        assert!(!second.deduped);
        assert_ne!(second.job_id, first.job_id);
    }

    #[tokio::test]
    async fn submission_failure_marks_error_without_task() {
        let h = harness();
        h.batch.fail_next_submit("quota exceeded").await;
        let err = h.driver.submit_job(heritability_request()).await.unwrap_err();
        let id = match err {
            DispatchError::SubmissionFailed { id, reason } => {
                assert!(reason.contains("quota exceeded"));
                id
            }
            other => panic!("unexpected {other:?}"),
        };
        let job = h.driver.poll(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error.as_deref().is_some_and(|e| !e.is_empty()));
        assert!(h.queue.tasks().await.is_empty());
    }

    #[tokio::test]
    async fn queue_failure_does_not_revert_submission() {
        let h = harness();
        h.queue.set_failing(true).await;
        let resp = h.driver.submit_job(heritability_request()).await.unwrap();
        assert_eq!(resp.status, JobStatus::Submitted);
        assert_eq!(h.driver.poll(&resp.job_id).await.unwrap().status, JobStatus::Submitted);
    }

    #[tokio::test]
    async fn invalid_input_writes_nothing() {
        let h = harness();
        let mut req = heritability_request();
        req.input.remove("trait");
        let err = h.driver.submit_job(req).await.unwrap_err();
        assert!(matches!(err, DispatchError::BadRequest(_)));
        assert!(h.registry.list_unfinished(10).await.unwrap().is_empty());
        assert!(h
            .registry
            .list_by_owner("alice@example.org", &Default::default())
            .await
            .unwrap()
            .is_empty());
        assert!(h.batch.submitted().await.is_empty());
    }

    #[tokio::test]
    async fn phenotype_reports_are_rejected() {
        let h = harness();
        let mut req = heritability_request();
        req.kind = JobKind::PhenotypeReport;
        assert!(matches!(
            h.driver.submit_job(req).await,
            Err(DispatchError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn heritability_table_is_uploaded_and_trait_derived() {
        let h = harness();
        let table = format!(
            "AssayNumber\tStrain\tTraitName\tReplicate\tValue\n{}",
            "1\tN2\tLifespan\tA\t12.5\n".repeat(400)
        );
        let req = SubmitJobRequest {
            kind: JobKind::Heritability,
            owner: "alice@example.org".into(),
            input: json!({"data": table}).as_object().cloned().unwrap(),
            container_version: None,
            no_cache: false,
        };
        let resp = h.driver.submit_job(req).await.unwrap();
        let job = h.driver.poll(&resp.job_id).await.unwrap();

        let path = paths::input_path(JobKind::Heritability, &job.id);
        assert_eq!(job.input_str("trait"), Some("Lifespan"));
        assert_eq!(job.input_str(DATA_BLOB_FIELD), Some(path.as_str()));
        // over the inline limit: only the pointer is kept
        assert!(job.input.get(DATA_FIELD).is_none());
        assert!(h.store.exists(&h.config.data_bucket, &path).await.unwrap());
        assert_eq!(job.input_str("data_hash").map(str::len), Some(32));
    }

    #[tokio::test]
    async fn empty_table_is_bad_request() {
        let h = harness();
        let req = SubmitJobRequest {
            kind: JobKind::Heritability,
            owner: "alice@example.org".into(),
            input: json!({"data": "AssayNumber\tStrain\tTraitName\n"}).as_object().cloned().unwrap(),
            container_version: None,
            no_cache: false,
        };
        assert!(matches!(h.driver.submit_job(req).await, Err(DispatchError::BadRequest(_))));
    }

    #[tokio::test]
    async fn refresh_follows_provider() {
        let h = harness();
        let resp = h.driver.submit_job(heritability_request()).await.unwrap();

        let r = h.driver.refresh_outcome(&resp.job_id).await.unwrap();
        assert_eq!(r.job.status, JobStatus::Running);
        assert!(!r.applied);

        // heritability must leave result.tsv behind
        let result = paths::result_path(JobKind::Heritability, &resp.job_id);
        h.store
            .put(&h.config.data_bucket, &result, Bytes::from_static(b"h2\n0.4\n"), "text/plain")
            .await
            .unwrap();
        h.batch.finish("op/1", None).await.unwrap();

        let r = h.driver.refresh_outcome(&resp.job_id).await.unwrap();
        assert_eq!(r.job.status, JobStatus::Complete);
        assert!(r.applied);

        // redundant refresh is a no-op
        let r = h.driver.refresh_outcome(&resp.job_id).await.unwrap();
        assert_eq!(r.job.status, JobStatus::Complete);
        assert!(!r.applied);
    }

    #[tokio::test]
    async fn missing_output_turns_completion_into_error() {
        let h = harness();
        let resp = h.driver.submit_job(heritability_request()).await.unwrap();
        h.batch.finish("op/1", None).await.unwrap();

        let r = h.driver.refresh_outcome(&resp.job_id).await.unwrap();
        assert_eq!(r.job.status, JobStatus::Error);
        assert!(r.applied);
        assert!(r.job.error.unwrap().contains("result.tsv"));
    }

    #[tokio::test]
    async fn provider_error_is_recorded() {
        let h = harness();
        let resp = h.driver.submit_job(heritability_request()).await.unwrap();
        h.batch.finish("op/1", Some("Execution failed")).await.unwrap();
        let job = h.driver.refresh(&resp.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("Execution failed (code 10)"));
    }

    #[tokio::test]
    async fn start_task_creates_and_replays() {
        let h = harness();
        let payload: StartTaskPayload = serde_json::from_value(json!({
            "id": "J1",
            "kind": "indel_primer",
            "email": "bob@example.org",
            "species": "c_elegans",
            "strain_1": "N2",
            "strain_2": "CB4856",
            "site": "I:1-100"
        }))
        .unwrap();

        let op = h.driver.start_task("indel-primer-queue", payload.clone()).await.unwrap();
        assert_eq!(op, "op/1");
        let job = h.driver.poll("J1").await.unwrap();
        assert_eq!(job.owner, "bob@example.org");
        assert!(job.input.get("email").is_none());

        let again = h.driver.start_task("indel-primer-queue", payload).await.unwrap();
        assert_eq!(again, op);
        assert_eq!(h.batch.submitted().await.len(), 1);
    }

    #[tokio::test]
    async fn start_task_rejects_foreign_queue() {
        let h = harness();
        let payload: StartTaskPayload =
            serde_json::from_value(json!({"id": "J1", "kind": "indel_primer", "email": "b@x.org"})).unwrap();
        assert!(matches!(
            h.driver.start_task("heritability-queue", payload.clone()).await,
            Err(DispatchError::BadRequest(_))
        ));
        assert!(matches!(
            h.driver.start_task("no-such-queue", payload).await,
            Err(DispatchError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn start_task_submits_existing_created_job() {
        let h = harness();
        let mut job = crate::registry::sample_job("J7", JobKind::GeneBrowserTracks, "h");
        job.input = json!({"wormbase_version": "WS283"}).as_object().cloned().unwrap();
        h.registry.create(&job).await.unwrap();

        let payload: StartTaskPayload =
            serde_json::from_value(json!({"id": "J7", "kind": "gene_browser_tracks"})).unwrap();
        let op = h.driver.start_task("gene-browser-tracks-queue", payload).await.unwrap();
        assert_eq!(h.driver.poll("J7").await.unwrap().operation_id, Some(op));
    }

    #[tokio::test]
    async fn newest_submitted_job_does_not_hide_running_one() {
        let h = harness();
        let running = h.driver.submit_job(heritability_request()).await.unwrap();
        h.driver.refresh(&running.job_id).await.unwrap();

        let mut forced = heritability_request();
        forced.no_cache = true;
        let newer = h.driver.submit_job(forced).await.unwrap();
        assert_eq!(newer.status, JobStatus::Submitted);

        let again = h.driver.submit_job(heritability_request()).await.unwrap();
        assert!(again.deduped);
        assert_eq!(again.job_id, running.job_id);
        assert_eq!(again.status, JobStatus::Running);
        assert_eq!(h.batch.submitted().await.len(), 2);
    }

    /// Fails the first `failures` moves to SUBMITTED with a transient error.
    struct FlakyRegistry {
        inner: MemoryRegistry,
        failures: AtomicU32,
    }

    impl FlakyRegistry {
        fn failing(n: u32) -> Self {
            Self {
                inner: MemoryRegistry::new(),
                failures: AtomicU32::new(n),
            }
        }
    }

    #[async_trait]
    impl JobRegistry for FlakyRegistry {
        async fn create(&self, job: &Job) -> Result<()> {
            self.inner.create(job).await
        }
        async fn get(&self, id: &str) -> Result<Job> {
            self.inner.get(id).await
        }
        async fn find_by_hash(&self, kind: JobKind, hash: &str) -> Result<Option<Job>> {
            self.inner.find_by_hash(kind, hash).await
        }
        async fn find_by_operation(&self, operation: &str) -> Result<Job> {
            self.inner.find_by_operation(operation).await
        }
        async fn transition(&self, id: &str, to: JobStatus, update: TransitionUpdate) -> Result<Job> {
            if to == JobStatus::Submitted
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(DispatchError::TransientUpstream("datastore 503".into()));
            }
            self.inner.transition(id, to, update).await
        }
        async fn mark_notified(&self, id: &str) -> Result<Job> {
            self.inner.mark_notified(id).await
        }
        async fn mark_checked(&self, id: &str) -> Result<()> {
            self.inner.mark_checked(id).await
        }
        async fn list_by_owner(&self, owner: &str, filter: &JobFilter) -> Result<Vec<Job>> {
            self.inner.list_by_owner(owner, filter).await
        }
        async fn list_unfinished(&self, limit: usize) -> Result<Vec<Job>> {
            self.inner.list_unfinished(limit).await
        }
    }

    fn driver_with(h: &Harness, registry: Arc<FlakyRegistry>) -> Driver {
        Driver::new(
            h.config.clone(),
            registry,
            h.store.clone(),
            h.batch.clone(),
            h.queue.clone(),
        )
    }

    #[tokio::test]
    async fn submission_write_is_retried() {
        let h = harness();
        let registry = Arc::new(FlakyRegistry::failing(1));
        let driver = driver_with(&h, registry.clone());

        let resp = driver.submit_job(heritability_request()).await.unwrap();
        let job = registry.get(&resp.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Submitted);
        assert_eq!(job.operation_id.as_deref(), Some("op/1"));
        assert_eq!(h.queue.tasks().await.len(), 1);

        // reachable by the notifier and the sweep
        assert_eq!(registry.find_by_operation("op/1").await.unwrap().id, resp.job_id);
        assert_eq!(registry.list_unfinished(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lost_submission_write_is_not_left_created() {
        let h = harness();
        let registry = Arc::new(FlakyRegistry::failing(100));
        let driver = driver_with(&h, registry.clone());

        let err = driver.submit_job(heritability_request()).await.unwrap_err();
        assert!(err.is_transient());

        let jobs = registry
            .list_by_owner("alice@example.org", &JobFilter::default())
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.operation_id.as_deref(), Some("op/1"));
        assert!(job.error.as_deref().is_some_and(|e| e.contains("op/1")));

        let log = paths::log_path(JobKind::Heritability, &job.id);
        assert!(h.store.exists(&h.config.logs_bucket, &log).await.unwrap());
    }

    #[tokio::test]
    async fn failed_submission_is_written_to_run_log() {
        let h = harness();
        h.batch.fail_next_submit("quota exceeded").await;
        let Err(DispatchError::SubmissionFailed { id, .. }) = h.driver.submit_job(heritability_request()).await else {
            panic!("expected a submission failure");
        };
        let log = h
            .store
            .get_bytes(&h.config.logs_bucket, &paths::log_path(JobKind::Heritability, &id))
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&log).contains("quota exceeded"));
    }

    #[tokio::test]
    async fn provider_error_is_appended_to_run_log() {
        let h = harness();
        let resp = h.driver.submit_job(heritability_request()).await.unwrap();
        let path = paths::log_path(JobKind::Heritability, &resp.job_id);
        h.store
            .put(&h.config.logs_bucket, &path, Bytes::from_static(b"started\n"), "text/plain")
            .await
            .unwrap();
        h.batch.finish("op/1", Some("Execution failed")).await.unwrap();
        h.driver.refresh(&resp.job_id).await.unwrap();

        let log = h.store.get_bytes(&h.config.logs_bucket, &path).await.unwrap();
        let text = String::from_utf8_lossy(&log);
        assert!(text.starts_with("started\n"));
        assert!(text.contains("op/1: Execution failed (code 10)"));
    }

    #[tokio::test]
    async fn completed_job_has_no_run_log() {
        let h = harness();
        let resp = h.driver.submit_job(heritability_request()).await.unwrap();
        let result = paths::result_path(JobKind::Heritability, &resp.job_id);
        h.store
            .put(&h.config.data_bucket, &result, Bytes::from_static(b"h2\n"), "text/plain")
            .await
            .unwrap();
        h.batch.finish("op/1", None).await.unwrap();
        h.driver.refresh(&resp.job_id).await.unwrap();
        let log = paths::log_path(JobKind::Heritability, &resp.job_id);
        assert!(!h.store.exists(&h.config.logs_bucket, &log).await.unwrap());
    }
}
