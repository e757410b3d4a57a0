use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use common::{PushEnvelope, QueueTask};
use serde::Serialize;
use std::{collections::HashMap, time::Duration};
use tokio::sync::Mutex;

use crate::error::{DispatchError, Result};
use crate::gcp::{duration_string, GoogleApi};

pub const QUEUE_NAME_HEADER: &str = "X-Queue-Name";
pub const TASK_NAME_HEADER: &str = "X-Queue-Taskname";

/// Per-kind task queue. Entries are delivered at least once.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, queue: &str, task: &QueueTask) -> Result<()>;
}

/* ---------------- in-memory ---------------- */

#[derive(Debug, Default)]
struct MemoryQueueState {
    tasks: Vec<(String, QueueTask)>,
    fail: bool,
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tasks(&self) -> Vec<(String, QueueTask)> {
        self.state.lock().await.tasks.clone()
    }

    /// Makes every enqueue fail until called again with `false`.
    pub async fn set_failing(&self, fail: bool) {
        self.state.lock().await.fail = fail;
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, queue: &str, task: &QueueTask) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail {
            return Err(DispatchError::TransientUpstream(format!("queue {queue} unavailable")));
        }
        // same task name: drop, like the real queue does
        if !state.tasks.iter().any(|(q, t)| q == queue && t.name() == task.name()) {
            state.tasks.push((queue.to_string(), task.clone()));
        }
        Ok(())
    }
}

/* ---------------- Cloud Tasks ---------------- */

const API: &str = "https://cloudtasks.googleapis.com/v2";

/// Cloud Tasks HTTP targets calling back `POST /task/status/{queue}` after
/// a delay, with a push envelope as body.
#[derive(Debug, Clone)]
pub struct CloudTasks {
    api: GoogleApi,
    project_id: String,
    location: String,
    service_url: String,
    service_account_email: String,
    delay: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest {
    task: CloudTask,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CloudTask {
    name: String,
    http_request: HttpRequest,
    schedule_time: String,
    dispatch_deadline: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpRequest {
    url: String,
    http_method: &'static str,
    headers: HashMap<String, String>,
    body: String,
    oidc_token: OidcToken,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OidcToken {
    service_account_email: String,
    audience: String,
}

impl CloudTasks {
    pub fn new(
        api: GoogleApi,
        project_id: impl Into<String>,
        location: impl Into<String>,
        service_url: impl Into<String>,
        service_account_email: impl Into<String>,
        delay: Duration,
    ) -> Self {
        Self {
            api,
            project_id: project_id.into(),
            location: location.into(),
            service_url: service_url.into(),
            service_account_email: service_account_email.into(),
            delay,
        }
    }

    fn queue_path(&self, queue: &str) -> String {
        format!(
            "projects/{}/locations/{}/queues/{}",
            self.project_id, self.location, queue
        )
    }

    fn build_task(&self, queue: &str, task: &QueueTask) -> Result<CloudTask> {
        let now = Utc::now();
        let envelope =
            PushEnvelope::for_status_check(&task.job_id, task.kind, &task.operation_id, &now.to_rfc3339());
        let body = serde_json::to_vec(&envelope)
            .map_err(|e| DispatchError::Upstream(format!("cannot encode status task: {e}")))?;
        let schedule = now + chrono::Duration::from_std(self.delay).unwrap_or_else(|_| chrono::Duration::zero());

        let headers = HashMap::from([
            ("Content-Type".to_string(), "application/json".to_string()),
            (QUEUE_NAME_HEADER.to_string(), queue.to_string()),
            (TASK_NAME_HEADER.to_string(), task.name()),
        ]);
        let base = self.service_url.trim_end_matches('/');

        Ok(CloudTask {
            name: format!("{}/tasks/{}", self.queue_path(queue), task.name()),
            http_request: HttpRequest {
                url: format!("{base}/task/status/{queue}"),
                http_method: "POST",
                headers,
                body: STANDARD.encode(body),
                oidc_token: OidcToken {
                    service_account_email: self.service_account_email.clone(),
                    audience: base.to_string(),
                },
            },
            schedule_time: schedule.to_rfc3339(),
            dispatch_deadline: duration_string(Duration::from_secs(600)),
        })
    }
}

#[async_trait]
impl TaskQueue for CloudTasks {
    async fn enqueue(&self, queue: &str, task: &QueueTask) -> Result<()> {
        let body = CreateTaskRequest {
            task: self.build_task(queue, task)?,
        };
        let req = self
            .api
            .http()
            .post(format!("{}/{}/tasks", API, self.queue_path(queue)))
            .json(&body);
        match self.api.send(req, &format!("task {}", task.name())).await {
            Ok(_) => Ok(()),
            // named tasks are deduplicated by the queue
            Err(DispatchError::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
