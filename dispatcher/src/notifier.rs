use async_trait::async_trait;
use common::{Job, JobKind, JobStatus, PushEnvelope};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

use crate::config::NotifierSettings;
use crate::driver::Driver;
use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ack,
    /// Ask the channel to redeliver.
    Nack,
}

/// Web-tier completion hook.
#[async_trait]
pub trait Webhook: Send + Sync {
    async fn job_finished(&self, kind: JobKind, job_id: &str, status: JobStatus) -> Result<()>;
}

/// `GET {base}/job-finish/{kind}/{job_id}/{status}` with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpWebhook {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpWebhook {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DispatchError::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn url(&self, kind: JobKind, job_id: &str, status: JobStatus) -> String {
        format!("{}/job-finish/{}/{}/{}", self.base_url, kind, job_id, status)
    }
}

#[async_trait]
impl Webhook for HttpWebhook {
    async fn job_finished(&self, kind: JobKind, job_id: &str, status: JobStatus) -> Result<()> {
        let resp = self
            .http
            .get(self.url(kind, job_id, status))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let code = resp.status();
        if code.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(DispatchError::from_status(code, "job-finish webhook", &body))
    }
}

/// Drives jobs to terminal state from completion events.
pub struct Notifier {
    driver: Arc<Driver>,
    webhook: Arc<dyn Webhook>,
    settings: NotifierSettings,
}

impl Notifier {
    pub fn new(driver: Arc<Driver>, webhook: Arc<dyn Webhook>, settings: NotifierSettings) -> Self {
        Self {
            driver,
            webhook,
            settings,
        }
    }

    /// Handles one pub/sub delivery. `BadRequest` when the envelope names
    /// no operation.
    pub async fn on_event(&self, envelope: &PushEnvelope) -> Result<Ack> {
        // 1) operacion
        let Some(operation) = envelope.operation() else {
            return Err(DispatchError::BadRequest("envelope has no operation attribute".into()));
        };

        // 2) buscar el job
        let job = match self.lookup(operation, envelope).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(operation = %operation, "no job for operation, dropping event");
                return Ok(Ack::Ack);
            }
            Err(e) if e.is_transient() => {
                warn!(operation = %operation, error = %e, "registry unavailable, nack");
                return Ok(Ack::Nack);
            }
            Err(e) => return Err(e),
        };

        // 3) estado real segun el proveedor
        let refreshed = match self.driver.refresh_outcome(&job.id).await {
            Ok(r) => r,
            Err(e) if e.is_transient() => {
                warn!(job_id = %job.id, operation = %operation, error = %e, "refresh failed, nack");
                return Ok(Ack::Nack);
            }
            Err(e) => {
                error!(job_id = %job.id, operation = %operation, error = %e, "refresh failed, dropping event");
                return Ok(Ack::Ack);
            }
        };

        // 4) notificar una vez por estado terminal
        if refreshed.applied || refreshed.job.awaiting_notification() {
            return self.notify(&refreshed.job).await;
        }
        debug!(job_id = %job.id, status = %refreshed.job.status, "nothing to notify");
        Ok(Ack::Ack)
    }

    /// Fires the webhook with backoff and records the delivery.
    pub async fn notify(&self, job: &Job) -> Result<Ack> {
        let s = &self.settings;
        for attempt in 0..s.webhook_max_attempts {
            match self.webhook.job_finished(job.kind, &job.id, job.status).await {
                Ok(()) => {
                    info!(job_id = %job.id, status = %job.status, "completion webhook delivered");
                    if let Err(e) = self.driver.registry().mark_notified(&job.id).await {
                        warn!(job_id = %job.id, error = %e, "could not record notification");
                    }
                    return Ok(Ack::Ack);
                }
                Err(e) => {
                    warn!(job_id = %job.id, attempt = attempt + 1, error = %e, "completion webhook failed");
                    if attempt + 1 < s.webhook_max_attempts {
                        tokio::time::sleep(backoff(attempt, s.webhook_base_delay, s.webhook_max_delay)).await;
                    }
                }
            }
        }
        Ok(Ack::Nack)
    }

    // El evento puede llegar antes que la escritura del submit: reintentar
    // y si no, usar el job id que traen nuestras status tasks
    async fn lookup(&self, operation: &str, envelope: &PushEnvelope) -> Result<Option<Job>> {
        let registry = self.driver.registry();
        let attempts = self.settings.lookup_retries + 1;
        for attempt in 0..attempts {
            match registry.find_by_operation(operation).await {
                Ok(job) => return Ok(Some(job)),
                Err(DispatchError::NotFound(_)) => {
                    debug!(operation = %operation, attempt = attempt + 1, "operation not indexed yet");
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.settings.lookup_delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(id) = envelope.job_id() {
            match registry.get(&id).await {
                Ok(job) if job.operation_id.as_deref() == Some(operation) => return Ok(Some(job)),
                Ok(_) | Err(DispatchError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

/// `base * 2^attempt`, capped.
pub fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(max)
}
