use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use common::{
    paths, CompletionMessage, Job, JobKind, JobResults, JobStatus, ListJobsQuery, PushEnvelope,
    ResultFile, StartTaskPayload, StartTaskResponse, SubmitJobRequest, SubmitJobResponse,
    VersionInfo,
};
use futures::TryStreamExt;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{DispatchError, Result};
use crate::notifications;
use crate::notifier::Ack;
use crate::queue::{QUEUE_NAME_HEADER, TASK_NAME_HEADER};
use crate::registry::JobFilter;
use crate::state::AppState;

// Rutas HTTP del dispatcher
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/task/test", get(health))
        .route("/version", get(version))
        .route("/task/start/:queue", post(start_task))
        .route("/task/status/:queue", post(status_event))
        .route("/job-finish/:kind/:job_id/:status", get(job_finish))
        .route("/api/v1/jobs", post(create_job).get(list_jobs))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/refresh", post(refresh_job))
        .route("/api/v1/jobs/:id/results", get(get_job_results))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- liveness ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn version(State(state): State<AppState>) -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_commit: state.config.git_commit.clone(),
    })
}

/* ---------------- queue + pub/sub ---------------- */

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DispatchError::BadRequest(format!("missing {name} header")))
}

// Entrega de la cola: arranca (o repite) un job
async fn start_task(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StartTaskResponse>> {
    let task_name = header_str(&headers, TASK_NAME_HEADER)?;
    let queue_header = header_str(&headers, QUEUE_NAME_HEADER)?;
    if queue_header != queue {
        return Err(DispatchError::Denied(format!(
            "task for queue {queue_header} delivered to {queue}"
        )));
    }
    let payload: StartTaskPayload = serde_json::from_slice(&body)
        .map_err(|e| DispatchError::BadRequest(format!("invalid task payload: {e}")))?;

    info!(queue = %queue, task = %task_name, job_id = %payload.id, "task start");
    let operation_id = state.driver.start_task(&queue, payload).await?;
    Ok(Json(StartTaskResponse { operation_id }))
}

// Push de pub/sub (o status task con el mismo envelope).
// Un no-2xx pide reentrega
async fn status_event(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    body: Bytes,
) -> Result<StatusCode> {
    let envelope: PushEnvelope = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            // reentregar basura no sirve de nada
            warn!(queue = %queue, error = %e, "dropping malformed status event");
            return Ok(StatusCode::OK);
        }
    };

    match state.notifier.on_event(&envelope).await? {
        Ack::Ack => Ok(StatusCode::OK),
        Ack::Nack => Ok(StatusCode::SERVICE_UNAVAILABLE),
    }
}

/* ---------------- completion webhook ---------------- */

fn check_bearer(headers: &HeaderMap, token: &str) -> Result<()> {
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(t) if t == token => Ok(()),
        _ => Err(DispatchError::Denied("invalid or missing access token".into())),
    }
}

// Webhook de fin de job, protegido con bearer
async fn job_finish(
    State(state): State<AppState>,
    Path((kind, job_id, status)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Json<CompletionMessage>> {
    check_bearer(&headers, &state.config.webhook_token)?;

    let kind: JobKind = kind
        .parse()
        .map_err(|e| DispatchError::BadRequest(format!("{e}")))?;
    let status: JobStatus = status
        .parse()
        .map_err(|e| DispatchError::BadRequest(format!("{e}")))?;

    let job = state.driver.poll(&job_id).await?;
    if job.kind != kind {
        return Err(DispatchError::not_found(format!("{kind} job {job_id}")));
    }
    notifications::render(&job, status, &state.config.site_base_url)
        .map(Json)
        .ok_or_else(|| DispatchError::BadRequest(format!("status {status} is not terminal")))
}

/* ---------------- jobs API ---------------- */

// Crea un job nuevo (o devuelve uno reutilizable)
async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>)> {
    let resp = state.driver.submit_job(req).await?;
    let code = if resp.deduped {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((code, Json(resp)))
}

// Lista los jobs de un owner
async fn list_jobs(
    State(state): State<AppState>,
    Query(q): Query<ListJobsQuery>,
) -> Result<Json<Vec<Job>>> {
    let filter = JobFilter {
        status: q.status,
        kind: q.kind,
        limit: None,
    };
    let jobs = state.driver.registry().list_by_owner(&q.owner, &filter).await?;
    Ok(Json(jobs))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Job>> {
    Ok(Json(state.driver.poll(&id).await?))
}

async fn refresh_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Job>> {
    Ok(Json(state.driver.refresh(&id).await?))
}

// Links firmados para todo lo que el pipeline escribio bajo el job
async fn get_job_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResults>> {
    let job = state.driver.poll(&id).await?;
    let bucket = &state.config.data_bucket;
    let ttl = state.config.signed_url_ttl;
    let prefix = paths::job_prefix(job.kind, &job.id);

    let blobs: Vec<_> = state.store.list(bucket, &prefix).try_collect().await?;
    let mut files = Vec::with_capacity(blobs.len());
    for blob in blobs {
        let name = blob.name.strip_prefix(&prefix).unwrap_or(&blob.name).to_string();
        if name == paths::INPUT_FILE {
            continue;
        }
        let url = state.store.sign(bucket, &blob.name, ttl).await?;
        files.push(ResultFile {
            name,
            size: blob.size,
            content_type: blob.content_type,
            url,
        });
    }

    let expires_at = Utc::now()
        + chrono::Duration::from_std(ttl)
            .map_err(|e| DispatchError::Config(format!("signed url ttl: {e}")))?;
    Ok(Json(JobResults {
        job_id: job.id,
        status: job.status,
        files,
        expires_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::MemoryBatch;
    use crate::config::test_config;
    use crate::notifier::tests::RecordingWebhook;
    use crate::queue::MemoryQueue;
    use crate::registry::MemoryRegistry;
    use crate::state::{Application, Backends};
    use crate::storage::{MemoryStore, ObjectStore};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        store: Arc<MemoryStore>,
        batch: Arc<MemoryBatch>,
        hook: Arc<RecordingWebhook>,
        bucket: String,
    }

    fn app() -> TestApp {
        let config = test_config();
        let bucket = config.data_bucket.clone();
        let store = Arc::new(MemoryStore::new());
        let batch = Arc::new(MemoryBatch::new());
        let hook = Arc::new(RecordingWebhook::default());
        let application = Application::with_backends(
            config,
            Backends {
                registry: Arc::new(MemoryRegistry::new()),
                store: store.clone(),
                batch: batch.clone(),
                queue: Arc::new(MemoryQueue::new()),
                webhook: hook.clone(),
            },
        );
        TestApp {
            router: build_router(application.state()),
            store,
            batch,
            hook,
            bucket,
        }
    }

    async fn call(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn heritability_body() -> Value {
        json!({
            "kind": "heritability",
            "owner": "alice@example.org",
            "input": {"trait": "Healthspan", "data_hash": "abc123"}
        })
    }

    async fn submit(app: &TestApp) -> String {
        let (status, body) = call(&app.router, post_json("/api/v1/jobs", heritability_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        body["job_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn liveness_routes_answer_ok() {
        let app = app();
        for uri in ["/", "/task/test"] {
            let resp = app
                .router
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&body[..], b"ok");
        }

        let (status, body) = call(&app.router, Request::get("/version").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn submit_then_read_and_list() {
        let app = app();
        let id = submit(&app).await;

        let (status, job) = call(&app.router, Request::get(format!("/api/v1/jobs/{id}")).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "SUBMITTED");
        assert_eq!(job["operation_id"], "op/1");

        // identical input while SUBMITTED is not a dedup hit
        let (status, second) = call(&app.router, post_json("/api/v1/jobs", heritability_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(second["deduped"], false);

        let (status, list) = call(
            &app.router,
            Request::get("/api/v1/jobs?owner=alice@example.org&status=SUBMITTED")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 2);

        let (_, none) = call(
            &app.router,
            Request::get("/api/v1/jobs?owner=bob@example.org").body(Body::empty()).unwrap(),
        )
        .await;
        assert!(none.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let app = app();
        let (status, body) = call(&app.router, Request::get("/api/v1/jobs/nope").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn unschedulable_kind_is_rejected() {
        let app = app();
        let body = json!({"kind": "phenotype_report", "owner": "alice@example.org", "input": {}});
        let (status, _) = call(&app.router, post_json("/api/v1/jobs", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    fn task_request(queue: &str, header_queue: Option<&str>, body: Value) -> Request<Body> {
        let mut req = Request::post(format!("/task/start/{queue}"))
            .header(header::CONTENT_TYPE, "application/json")
            .header(TASK_NAME_HEADER, "task-1");
        if let Some(q) = header_queue {
            req = req.header(QUEUE_NAME_HEADER, q);
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    fn task_payload() -> Value {
        json!({
            "id": "J1",
            "kind": "heritability",
            "email": "alice@example.org",
            "trait": "Healthspan",
            "data_hash": "abc123"
        })
    }

    #[tokio::test]
    async fn task_start_validates_headers() {
        let app = app();
        let (status, _) = call(&app.router, task_request("heritability-queue", None, task_payload())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app.router,
            task_request("heritability-queue", Some("indel-primer-queue"), task_payload()),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &app.router,
            task_request("heritability-queue", Some("heritability-queue"), json!({"id": "J1"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn task_start_replays_are_idempotent() {
        let app = app();
        let req = || task_request("heritability-queue", Some("heritability-queue"), task_payload());

        let (status, body) = call(&app.router, req()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["operation_id"], "op/1");

        let (status, body) = call(&app.router, req()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["operation_id"], "op/1");
        assert_eq!(app.batch.submitted().await.len(), 1);
    }

    #[tokio::test]
    async fn status_event_completes_job_and_notifies() {
        let app = app();
        let id = submit(&app).await;
        app.batch.finish("op/1", None).await.unwrap();
        app.store
            .put(
                &app.bucket,
                &paths::result_path(JobKind::Heritability, &id),
                Bytes::from_static(b"trait\th2\n"),
                "text/tab-separated-values",
            )
            .await
            .unwrap();

        let envelope = json!({
            "message": {"attributes": {"operation": "op/1"}, "messageId": "1"},
            "subscription": "projects/caendr-dev/subscriptions/pipeline-status"
        });
        let (status, _) = call(&app.router, post_json("/task/status/heritability-queue", envelope.clone())).await;
        assert_eq!(status, StatusCode::OK);

        let (_, job) = call(&app.router, Request::get(format!("/api/v1/jobs/{id}")).body(Body::empty()).unwrap()).await;
        assert_eq!(job["status"], "COMPLETE");
        assert_eq!(
            *app.hook.calls.lock().await,
            vec![format!("/job-finish/heritability/{id}/COMPLETE")]
        );

        // redelivery does not notify twice
        let (status, _) = call(&app.router, post_json("/task/status/heritability-queue", envelope)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.hook.calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn malformed_status_events() {
        let app = app();
        let req = Request::post("/task/status/heritability-queue")
            .body(Body::from("not json"))
            .unwrap();
        let (status, _) = call(&app.router, req).await;
        assert_eq!(status, StatusCode::OK);

        let no_op = json!({"message": {"attributes": {}}, "subscription": "s"});
        let (status, _) = call(&app.router, post_json("/task/status/heritability-queue", no_op)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    fn finish_request(path: &str, token: Option<&str>) -> Request<Body> {
        let mut req = Request::get(path);
        if let Some(t) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {t}"));
        }
        req.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn job_finish_requires_token_and_terminal_status() {
        let app = app();
        let id = submit(&app).await;
        let path = format!("/job-finish/heritability/{id}/ERROR");

        let (status, _) = call(&app.router, finish_request(&path, None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&app.router, finish_request(&path, Some("wrong"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&app.router, finish_request(&path, Some("s3cret"))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["text"].as_str().unwrap().contains("failed"));

        let running = format!("/job-finish/heritability/{id}/RUNNING");
        let (status, _) = call(&app.router, finish_request(&running, Some("s3cret"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let bogus = format!("/job-finish/heritability/{id}/DONE");
        let (status, _) = call(&app.router, finish_request(&bogus, Some("s3cret"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app.router, finish_request("/job-finish/heritability/nope/COMPLETE", Some("s3cret"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn results_are_signed_and_skip_input() {
        let app = app();
        let id = submit(&app).await;
        app.store
            .put(
                &app.bucket,
                &paths::result_path(JobKind::Heritability, &id),
                Bytes::from_static(b"trait\th2\n"),
                "text/tab-separated-values",
            )
            .await
            .unwrap();

        let (status, body) = call(
            &app.router,
            Request::get(format!("/api/v1/jobs/{id}/results")).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let files = body["files"].as_array().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0]["name"], "result.tsv");
        assert!(files[0]["url"].as_str().unwrap().contains("?expires="));
    }
}
