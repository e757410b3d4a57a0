use async_trait::async_trait;
use chrono::Utc;
use common::{Job, JobKind, JobStatus};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, Default)]
pub struct TransitionUpdate {
    pub operation_id: Option<String>,
    pub error: Option<String>,
    /// Compare-and-set guard: fail with `StaleStatus` unless the job is
    /// currently in this status.
    pub expected: Option<JobStatus>,
}

impl TransitionUpdate {
    pub fn operation(op: impl Into<String>) -> Self {
        Self {
            operation_id: Some(op.into()),
            ..Self::default()
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            error: Some(msg.into()),
            ..Self::default()
        }
    }

    pub fn expecting(mut self, status: JobStatus) -> Self {
        self.expected = Some(status);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s) && self.kind.map_or(true, |k| job.kind == k)
    }
}

/// Durable catalog of jobs. Single-key operations are strongly consistent;
/// queries may lag.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Fails `AlreadyExists` on id collision.
    async fn create(&self, job: &Job) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Job>;

    /// Reusable job with this key: COMPLETE first, then the newest RUNNING.
    async fn find_by_hash(&self, kind: JobKind, hash: &str) -> Result<Option<Job>>;

    async fn find_by_operation(&self, operation: &str) -> Result<Job>;

    /// Atomic, forward-only status change.
    async fn transition(&self, id: &str, to: JobStatus, update: TransitionUpdate) -> Result<Job>;

    /// Records that the web tier accepted the terminal status.
    async fn mark_notified(&self, id: &str) -> Result<Job>;

    /// Newest first.
    async fn list_by_owner(&self, owner: &str, filter: &JobFilter) -> Result<Vec<Job>>;

    /// SUBMITTED or RUNNING jobs, least recently checked first.
    async fn list_unfinished(&self, limit: usize) -> Result<Vec<Job>>;

    /// Stamps `checked_at` so the next sweep starts elsewhere. Status is
    /// left alone.
    async fn mark_checked(&self, id: &str) -> Result<()>;
}

/// The state machine shared by every backend. `Ok(None)` means the job is
/// already in `to` and nothing needs writing.
pub fn apply_transition(job: &Job, to: JobStatus, update: &TransitionUpdate) -> Result<Option<Job>> {
    if let Some(expected) = update.expected {
        if job.status != expected {
            return Err(DispatchError::StaleStatus {
                id: job.id.clone(),
                expected,
                actual: job.status,
            });
        }
    }
    if job.status == to {
        return Ok(None);
    }
    if !job.status.can_advance_to(to) {
        return Err(DispatchError::StateRegression {
            id: job.id.clone(),
            from: job.status,
            to,
        });
    }

    let operation_id = update.operation_id.clone().or_else(|| job.operation_id.clone());
    if matches!(to, JobStatus::Submitted | JobStatus::Running) && operation_id.is_none() {
        return Err(DispatchError::BadRequest(format!(
            "job {} cannot become {} without an operation id",
            job.id, to
        )));
    }

    let mut next = job.clone();
    next.status = to;
    next.operation_id = operation_id;
    if update.error.is_some() {
        next.error = update.error.clone();
    }
    next.updated_at = Utc::now();
    Ok(Some(next))
}

/// Ordering used by `find_by_hash`. Only COMPLETE and RUNNING jobs can be
/// reused; COMPLETE wins, then recency.
pub fn best_dedup_candidate(jobs: impl IntoIterator<Item = Job>) -> Option<Job> {
    jobs.into_iter()
        .filter(|j| matches!(j.status, JobStatus::Complete | JobStatus::Running))
        .max_by_key(|j| (j.status == JobStatus::Complete, j.updated_at))
}

/* ---------------- in-memory ---------------- */

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<String, Job>,
    by_operation: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    tables: RwLock<Tables>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRegistry for MemoryRegistry {
    async fn create(&self, job: &Job) -> Result<()> {
        let mut t = self.tables.write().await;
        if t.jobs.contains_key(&job.id) {
            return Err(DispatchError::AlreadyExists(format!("job {}", job.id)));
        }
        if let Some(op) = &job.operation_id {
            t.by_operation.insert(op.clone(), job.id.clone());
        }
        t.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Job> {
        self.tables
            .read()
            .await
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::not_found(format!("job {id}")))
    }

    async fn find_by_hash(&self, kind: JobKind, hash: &str) -> Result<Option<Job>> {
        let t = self.tables.read().await;
        Ok(best_dedup_candidate(
            t.jobs
                .values()
                .filter(|j| j.kind == kind && j.data_hash == hash)
                .cloned(),
        ))
    }

    async fn find_by_operation(&self, operation: &str) -> Result<Job> {
        let t = self.tables.read().await;
        t.by_operation
            .get(operation)
            .and_then(|id| t.jobs.get(id))
            .cloned()
            .ok_or_else(|| DispatchError::not_found(format!("operation {operation}")))
    }

    async fn transition(&self, id: &str, to: JobStatus, update: TransitionUpdate) -> Result<Job> {
        let mut t = self.tables.write().await;
        let current = t
            .jobs
            .get(id)
            .ok_or_else(|| DispatchError::not_found(format!("job {id}")))?;

        match apply_transition(current, to, &update)? {
            None => Ok(current.clone()),
            Some(next) => {
                if let Some(op) = &next.operation_id {
                    t.by_operation.insert(op.clone(), next.id.clone());
                }
                t.jobs.insert(next.id.clone(), next.clone());
                Ok(next)
            }
        }
    }

    async fn mark_notified(&self, id: &str) -> Result<Job> {
        let mut t = self.tables.write().await;
        let job = t
            .jobs
            .get_mut(id)
            .ok_or_else(|| DispatchError::not_found(format!("job {id}")))?;
        if job.status.is_terminal() && job.notified_at.is_none() {
            job.notified_at = Some(Utc::now());
        }
        Ok(job.clone())
    }

    async fn list_by_owner(&self, owner: &str, filter: &JobFilter) -> Result<Vec<Job>> {
        let t = self.tables.read().await;
        let mut jobs: Vec<Job> = t
            .jobs
            .values()
            .filter(|j| j.owner == owner && filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn list_unfinished(&self, limit: usize) -> Result<Vec<Job>> {
        let t = self.tables.read().await;
        let mut jobs: Vec<Job> = t
            .jobs
            .values()
            .filter(|j| matches!(j.status, JobStatus::Submitted | JobStatus::Running))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| (a.last_checked(), &a.id).cmp(&(b.last_checked(), &b.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn mark_checked(&self, id: &str) -> Result<()> {
        let mut t = self.tables.write().await;
        let job = t
            .jobs
            .get_mut(id)
            .ok_or_else(|| DispatchError::not_found(format!("job {id}")))?;
        job.checked_at = Some(Utc::now());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_job(id: &str, kind: JobKind, hash: &str) -> Job {
    let container = common::ContainerRef {
        registry: "docker.io/caendr".into(),
        name: kind.to_string(),
        version: "v1".into(),
    };
    Job::new(id.to_string(), kind, "alice@example.org", hash, container, common::JobInput::new())
}
