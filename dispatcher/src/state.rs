use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::batch::{BatchCompute, MemoryBatch};
use crate::config::{Backend, Config};
use crate::datastore::DatastoreRegistry;
use crate::driver::Driver;
use crate::error::Result;
use crate::gcp::GoogleApi;
use crate::gcs::GcsStore;
use crate::lifesciences::LifeSciences;
use crate::monitor;
use crate::notifier::{HttpWebhook, Notifier, Webhook};
use crate::queue::{CloudTasks, MemoryQueue, TaskQueue};
use crate::registry::{JobRegistry, MemoryRegistry};
use crate::storage::{MemoryStore, ObjectStore};

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ObjectStore>,
    pub driver: Arc<Driver>,
    pub notifier: Arc<Notifier>,
}

/// External collaborators, wired once at startup.
pub struct Backends {
    pub registry: Arc<dyn JobRegistry>,
    pub store: Arc<dyn ObjectStore>,
    pub batch: Arc<dyn BatchCompute>,
    pub queue: Arc<dyn TaskQueue>,
    pub webhook: Arc<dyn Webhook>,
}

impl Backends {
    pub fn memory(config: &Config) -> Result<Self> {
        Ok(Self {
            registry: Arc::new(MemoryRegistry::new()),
            store: Arc::new(MemoryStore::new()),
            batch: Arc::new(MemoryBatch::new()),
            queue: Arc::new(MemoryQueue::new()),
            webhook: Arc::new(HttpWebhook::new(&config.site_base_url, &config.webhook_token)?),
        })
    }

    pub async fn gcp(config: &Config) -> Result<Self> {
        let api = GoogleApi::from_environment().await?;
        let sa = config.service_account_email();
        Ok(Self {
            registry: Arc::new(DatastoreRegistry::new(api.clone(), &config.project_id)),
            store: Arc::new(GcsStore::new(api.clone(), &sa)),
            batch: Arc::new(LifeSciences::new(api.clone(), &config.project_id, &config.region)),
            queue: Arc::new(CloudTasks::new(
                api,
                &config.project_id,
                &config.region,
                &config.task_service_url,
                &sa,
                config.status_task_delay,
            )),
            webhook: Arc::new(HttpWebhook::new(&config.site_base_url, &config.webhook_token)?),
        })
    }
}

// Orden de arranque: config, backends, driver, notifier y monitor
pub struct Application {
    state: AppState,
    shutdown: watch::Sender<bool>,
    monitor: Option<JoinHandle<()>>,
}

impl Application {
    pub async fn build(config: Config) -> Result<Self> {
        let backends = match config.backend {
            Backend::Gcp => Backends::gcp(&config).await?,
            Backend::Memory => {
                warn!("using in-memory backends; nothing is persisted");
                Backends::memory(&config)?
            }
        };
        Ok(Self::with_backends(config, backends))
    }

    pub fn with_backends(config: Config, b: Backends) -> Self {
        let config = Arc::new(config);
        let driver = Arc::new(Driver::new(
            config.clone(),
            b.registry,
            b.store.clone(),
            b.batch,
            b.queue,
        ));
        let notifier = Arc::new(Notifier::new(driver.clone(), b.webhook, config.notifier.clone()));
        let (shutdown, _) = watch::channel(false);
        Self {
            state: AppState {
                config,
                store: b.store,
                driver,
                notifier,
            },
            shutdown,
            monitor: None,
        }
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn start_monitor(&mut self) {
        let cfg = &self.state.config;
        let handle = tokio::spawn(monitor::reconcile_jobs(
            self.state.driver.clone(),
            self.state.notifier.clone(),
            cfg.monitor_interval,
            cfg.monitor_stale_after,
            self.shutdown.subscribe(),
        ));
        self.monitor = Some(handle);
    }

    // corta el monitor y espera a que termine
    pub async fn teardown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.monitor.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "monitor task ended abnormally");
            }
        }
        info!("dispatcher stopped");
    }
}
