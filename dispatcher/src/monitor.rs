use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::driver::Driver;
use crate::notifier::Notifier;

const SWEEP_LIMIT: usize = 100;

/// Loop de reconciliacion en segundo plano:
/// - busca jobs SUBMITTED/RUNNING sin revisar hace `stale_after`
/// - los refresca contra el proveedor
/// - notifica los que quedaron terminales
pub async fn reconcile_jobs(
    driver: Arc<Driver>,
    notifier: Arc<Notifier>,
    interval: Duration,
    stale_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                info!("reconciliation monitor stopping");
                return;
            }
        }
        let touched = sweep(&driver, &notifier, stale_after).await;
        if touched > 0 {
            info!(touched, "reconciliation sweep finished");
        }
    }
}

/// Una pasada sobre los jobs revisados hace mas tiempo.
/// Devuelve cuantos cambiaron de estado.
pub async fn sweep(driver: &Driver, notifier: &Notifier, stale_after: Duration) -> usize {
    let jobs = match driver.registry().list_unfinished(SWEEP_LIMIT).await {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(error = %e, "could not list unfinished jobs");
            return 0;
        }
    };

    let cutoff = Utc::now() - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());
    let mut touched = 0;

    for job in jobs.into_iter().filter(|j| j.last_checked() <= cutoff) {
        let refreshed = match driver.refresh_outcome(&job.id).await {
            Ok(r) => r,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "reconciliation refresh failed");
                mark_checked(driver, &job.id).await;
                continue;
            }
        };
        if refreshed.job.status != job.status {
            touched += 1;
        } else {
            // sin cambios: al final de la cola para la proxima pasada
            mark_checked(driver, &job.id).await;
        }
        if refreshed.applied {
            debug!(job_id = %job.id, status = %refreshed.job.status, "reconciled to terminal status");
            if let Err(e) = notifier.notify(&refreshed.job).await {
                warn!(job_id = %job.id, error = %e, "reconciliation webhook failed");
            }
        }
    }
    touched
}

async fn mark_checked(driver: &Driver, id: &str) {
    if let Err(e) = driver.registry().mark_checked(id).await {
        warn!(job_id = %id, error = %e, "could not record reconciliation check");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::tests::{harness, heritability_request};
    use crate::notifier::tests::{fast_settings, RecordingWebhook};
    use common::JobStatus;
    use serde_json::json;

    #[tokio::test]
    async fn sweep_finishes_stale_jobs() {
        let h = harness();
        let hook = Arc::new(RecordingWebhook::default());
        let notifier = Notifier::new(h.driver.clone(), hook.clone(), fast_settings());

        let resp = h.driver.submit_job(heritability_request()).await.unwrap();
        h.batch.finish("op/1", Some("Execution failed")).await.unwrap();

        // not stale yet
        assert_eq!(sweep(&h.driver, &notifier, Duration::from_secs(3600)).await, 0);
        assert_eq!(h.driver.poll(&resp.job_id).await.unwrap().status, JobStatus::Submitted);

        assert_eq!(sweep(&h.driver, &notifier, Duration::ZERO).await, 1);
        assert_eq!(h.driver.poll(&resp.job_id).await.unwrap().status, JobStatus::Error);
        assert_eq!(hook.calls.lock().await.len(), 1);

        // nothing left to do
        assert_eq!(sweep(&h.driver, &notifier, Duration::ZERO).await, 0);
    }

    #[tokio::test]
    async fn monitor_stops_on_shutdown() {
        let h = harness();
        let notifier = Arc::new(Notifier::new(
            h.driver.clone(),
            Arc::new(RecordingWebhook::default()),
            fast_settings(),
        ));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reconcile_jobs(
            h.driver.clone(),
            notifier,
            Duration::from_secs(3600),
            Duration::ZERO,
            rx,
        ));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn sweep_reaches_jobs_past_the_first_page() {
        let h = harness();
        let hook = Arc::new(RecordingWebhook::default());
        let notifier = Notifier::new(h.driver.clone(), hook.clone(), fast_settings());

        let mut last = String::new();
        for n in 0..=SWEEP_LIMIT {
            let mut req = heritability_request();
            req.input.insert("trait".into(), json!(format!("trait-{n}")));
            last = h.driver.submit_job(req).await.unwrap().job_id;
        }
        let op = h.driver.poll(&last).await.unwrap().operation_id.unwrap();
        assert_eq!(op, format!("op/{}", SWEEP_LIMIT + 1));
        h.batch.finish(&op, Some("Execution failed")).await.unwrap();

        for _ in 0..3 {
            sweep(&h.driver, &notifier, Duration::ZERO).await;
        }
        assert_eq!(h.driver.poll(&last).await.unwrap().status, JobStatus::Error);
        assert_eq!(
            *hook.calls.lock().await,
            vec![format!("/job-finish/heritability/{last}/ERROR")]
        );
    }

    #[tokio::test]
    async fn unchanged_jobs_are_stamped_as_checked() {
        let h = harness();
        let notifier = Notifier::new(h.driver.clone(), Arc::new(RecordingWebhook::default()), fast_settings());
        let resp = h.driver.submit_job(heritability_request()).await.unwrap();
        h.driver.refresh(&resp.job_id).await.unwrap();
        let before = h.driver.poll(&resp.job_id).await.unwrap();

        assert_eq!(sweep(&h.driver, &notifier, Duration::ZERO).await, 0);
        let after = h.driver.poll(&resp.job_id).await.unwrap();
        assert_eq!(after.status, JobStatus::Running);
        assert_eq!(after.updated_at, before.updated_at);
        assert!(after.last_checked() > before.last_checked());
    }
}
