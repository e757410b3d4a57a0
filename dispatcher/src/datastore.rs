use async_trait::async_trait;
use common::{Job, JobKind, JobStatus};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{DispatchError, Result};
use crate::gcp::GoogleApi;
use crate::registry::{apply_transition, best_dedup_candidate, JobFilter, JobRegistry, TransitionUpdate};

const API: &str = "https://datastore.googleapis.com/v1";
const ENTITY_KIND: &str = "PipelineJob";
const PAGE_LIMIT: usize = 500;

/// Job registry over Cloud Datastore. Lookups by key are strongly
/// consistent; queries are not. Transitions run inside a transaction.
#[derive(Debug, Clone)]
pub struct DatastoreRegistry {
    api: GoogleApi,
    project_id: String,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    found: Vec<EntityResult>,
}

#[derive(Debug, Deserialize)]
struct EntityResult {
    entity: Value,
}

#[derive(Debug, Deserialize)]
struct BeginTransactionResponse {
    transaction: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    batch: QueryBatch,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryBatch {
    #[serde(default)]
    entity_results: Vec<EntityResult>,
    #[serde(default)]
    end_cursor: Option<String>,
    #[serde(default)]
    more_results: String,
}

impl DatastoreRegistry {
    pub fn new(api: GoogleApi, project_id: impl Into<String>) -> Self {
        Self {
            api,
            project_id: project_id.into(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/projects/{}:{}", API, self.project_id, method)
    }

    fn key(&self, id: &str) -> Value {
        json!({
            "partitionId": {"projectId": self.project_id},
            "path": [{"kind": ENTITY_KIND, "name": id}]
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, method: &str, body: Value) -> Result<T> {
        let req = self.api.http().post(self.url(method)).json(&body);
        self.api.send_json(req, &format!("datastore {method}")).await
    }

    async fn lookup(&self, id: &str, transaction: Option<&str>) -> Result<Option<Job>> {
        let mut body = json!({"keys": [self.key(id)]});
        if let Some(tx) = transaction {
            body["readOptions"] = json!({"transaction": tx});
        }
        let resp: LookupResponse = self.call("lookup", body).await?;
        resp.found
            .into_iter()
            .next()
            .map(|r| entity_to_job(&r.entity))
            .transpose()
    }

    async fn commit(&self, mutation: Value, transaction: Option<&str>) -> Result<()> {
        let body = match transaction {
            Some(tx) => json!({"mode": "TRANSACTIONAL", "transaction": tx, "mutations": [mutation]}),
            None => json!({"mode": "NON_TRANSACTIONAL", "mutations": [mutation]}),
        };
        let _: Value = self.call("commit", body).await?;
        Ok(())
    }

    async fn rollback(&self, transaction: &str) {
        let res: Result<Value> = self.call("rollback", json!({"transaction": transaction})).await;
        if let Err(e) = res {
            tracing::warn!(error = %e, "datastore rollback failed");
        }
    }

    // abre transaccion y lee el job; el caller hace commit o rollback
    async fn read_for_update(&self, id: &str) -> Result<(String, Job)> {
        let begin: BeginTransactionResponse = self.call("beginTransaction", json!({})).await?;
        let tx = begin.transaction;
        match self.lookup(id, Some(&tx)).await {
            Ok(Some(job)) => Ok((tx, job)),
            Ok(None) => {
                self.rollback(&tx).await;
                Err(DispatchError::not_found(format!("job {id}")))
            }
            Err(e) => {
                self.rollback(&tx).await;
                Err(e)
            }
        }
    }

    async fn write_back(&self, tx: &str, job: &Job) -> Result<()> {
        let entity = job_to_entity(self.key(&job.id), job)?;
        match self.commit(json!({"update": entity}), Some(tx)).await {
            // contention: the transaction was aborted, caller may retry
            Err(DispatchError::AlreadyExists(_)) => Err(DispatchError::TransientUpstream(format!(
                "update of job {} aborted by a concurrent write",
                job.id
            ))),
            other => other,
        }
    }

    /// Equality filters ANDed together, all pages. `order_by` sorts ascending
    /// and needs a composite index.
    async fn query(
        &self,
        filters: &[(&str, Value)],
        order_by: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>> {
        let property_filters: Vec<Value> = filters
            .iter()
            .map(|(name, value)| {
                json!({"propertyFilter": {
                    "property": {"name": name},
                    "op": "EQUAL",
                    "value": value
                }})
            })
            .collect();
        let filter = match property_filters.len() {
            1 => property_filters[0].clone(),
            _ => json!({"compositeFilter": {"op": "AND", "filters": property_filters}}),
        };

        let mut jobs = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = limit.map_or(PAGE_LIMIT, |l| (l - jobs.len()).min(PAGE_LIMIT));
            let mut query = json!({
                "kind": [{"name": ENTITY_KIND}],
                "filter": filter,
                "limit": page
            });
            if let Some(prop) = order_by {
                query["order"] = json!([{"property": {"name": prop}, "direction": "ASCENDING"}]);
            }
            if let Some(c) = &cursor {
                query["startCursor"] = json!(c);
            }
            let resp: QueryResponse = self
                .call(
                    "runQuery",
                    json!({"partitionId": {"projectId": self.project_id}, "query": query}),
                )
                .await?;

            for r in &resp.batch.entity_results {
                jobs.push(entity_to_job(&r.entity)?);
            }

            let done = resp.batch.more_results != "NOT_FINISHED"
                || resp.batch.entity_results.is_empty()
                || limit.is_some_and(|l| jobs.len() >= l);
            if done {
                return Ok(jobs);
            }
            cursor = resp.batch.end_cursor;
        }
    }
}

#[async_trait]
impl JobRegistry for DatastoreRegistry {
    async fn create(&self, job: &Job) -> Result<()> {
        let entity = job_to_entity(self.key(&job.id), job)?;
        match self.commit(json!({"insert": entity}), None).await {
            // ALREADY_EXISTS comes back as 409
            Err(DispatchError::AlreadyExists(_)) => Err(DispatchError::AlreadyExists(format!("job {}", job.id))),
            other => other,
        }
    }

    async fn get(&self, id: &str) -> Result<Job> {
        self.lookup(id, None)
            .await?
            .ok_or_else(|| DispatchError::not_found(format!("job {id}")))
    }

    async fn find_by_hash(&self, kind: JobKind, hash: &str) -> Result<Option<Job>> {
        let jobs = self
            .query(
                &[
                    ("kind", json!({"stringValue": kind.as_str()})),
                    ("data_hash", json!({"stringValue": hash})),
                ],
                None,
                None,
            )
            .await?;
        Ok(best_dedup_candidate(jobs))
    }

    async fn find_by_operation(&self, operation: &str) -> Result<Job> {
        let jobs = self
            .query(&[("operation_id", json!({"stringValue": operation}))], None, Some(1))
            .await?;
        let id = jobs
            .into_iter()
            .next()
            .map(|j| j.id)
            .ok_or_else(|| DispatchError::not_found(format!("operation {operation}")))?;
        // re-read by key for a consistent view
        self.get(&id).await
    }

    async fn transition(&self, id: &str, to: JobStatus, update: TransitionUpdate) -> Result<Job> {
        let (tx, current) = self.read_for_update(id).await?;
        let next = match apply_transition(&current, to, &update) {
            Ok(Some(next)) => next,
            Ok(None) => {
                self.rollback(&tx).await;
                return Ok(current);
            }
            Err(e) => {
                self.rollback(&tx).await;
                return Err(e);
            }
        };
        self.write_back(&tx, &next).await?;
        Ok(next)
    }

    async fn mark_notified(&self, id: &str) -> Result<Job> {
        let (tx, mut job) = self.read_for_update(id).await?;
        if !job.status.is_terminal() || job.notified_at.is_some() {
            self.rollback(&tx).await;
            return Ok(job);
        }
        job.notified_at = Some(chrono::Utc::now());
        self.write_back(&tx, &job).await?;
        Ok(job)
    }

    async fn list_by_owner(&self, owner: &str, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut filters = vec![("owner", json!({"stringValue": owner}))];
        if let Some(status) = filter.status {
            filters.push(("status", json!({"stringValue": status.as_str()})));
        }
        if let Some(kind) = filter.kind {
            filters.push(("kind", json!({"stringValue": kind.as_str()})));
        }
        let mut jobs = self.query(&filters, None, None).await?;
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn list_unfinished(&self, limit: usize) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for status in [JobStatus::Submitted, JobStatus::Running] {
            let found = self
                .query(
                    &[("status", json!({"stringValue": status.as_str()}))],
                    Some("checked_at"),
                    Some(limit),
                )
                .await?;
            jobs.extend(found);
        }
        jobs.sort_by(|a, b| (a.last_checked(), &a.id).cmp(&(b.last_checked(), &b.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn mark_checked(&self, id: &str) -> Result<()> {
        let (tx, mut job) = self.read_for_update(id).await?;
        job.checked_at = Some(chrono::Utc::now());
        self.write_back(&tx, &job).await
    }
}

/* ---- entity mapping ---- */

// Indexed properties for the queries above, plus the full record as JSON.
fn job_to_entity(key: Value, job: &Job) -> Result<Value> {
    let payload = serde_json::to_string(job)
        .map_err(|e| DispatchError::Upstream(format!("cannot encode job {}: {e}", job.id)))?;
    let operation = match &job.operation_id {
        Some(op) => json!({"stringValue": op}),
        None => json!({"nullValue": null}),
    };
    Ok(json!({
        "key": key,
        "properties": {
            "kind": {"stringValue": job.kind.as_str()},
            "owner": {"stringValue": job.owner},
            "data_hash": {"stringValue": job.data_hash},
            "status": {"stringValue": job.status.as_str()},
            "operation_id": operation,
            "created_at": {"timestampValue": job.created_at.to_rfc3339()},
            "updated_at": {"timestampValue": job.updated_at.to_rfc3339()},
            "checked_at": {"timestampValue": job.last_checked().to_rfc3339()},
            "payload": {"stringValue": payload, "excludeFromIndexes": true}
        }
    }))
}

fn entity_to_job(entity: &Value) -> Result<Job> {
    let payload = entity
        .pointer("/properties/payload/stringValue")
        .and_then(Value::as_str)
        .ok_or_else(|| DispatchError::Upstream("datastore entity without payload".into()))?;
    Ok(serde_json::from_str(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::sample_job;

    #[test]
    fn entity_round_trip_keeps_indexed_properties() {
        let mut job = sample_job("J1", JobKind::Heritability, "abc");
        job.status = JobStatus::Submitted;
        job.operation_id = Some("projects/1/locations/x/operations/9".into());

        let entity = job_to_entity(json!({"path": [{"kind": ENTITY_KIND, "name": "J1"}]}), &job).unwrap();
        assert_eq!(entity.pointer("/properties/status/stringValue"), Some(&json!("SUBMITTED")));
        assert_eq!(entity.pointer("/properties/data_hash/stringValue"), Some(&json!("abc")));
        // sweeps sort on it, so it is always present
        assert_eq!(
            entity.pointer("/properties/checked_at/timestampValue"),
            Some(&json!(job.updated_at.to_rfc3339()))
        );
        assert_eq!(
            entity.pointer("/properties/payload/excludeFromIndexes"),
            Some(&json!(true))
        );

        let back = entity_to_job(&entity).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn missing_operation_is_stored_as_null() {
        let job = sample_job("J2", JobKind::IndelPrimer, "h");
        let entity = job_to_entity(json!({}), &job).unwrap();
        assert_eq!(entity.pointer("/properties/operation_id/nullValue"), Some(&Value::Null));
    }

    #[test]
    fn entity_without_payload_is_rejected() {
        assert!(entity_to_job(&json!({"properties": {}})).is_err());
    }
}
