mod batch;
mod config;
mod datastore;
mod driver;
mod error;
mod gcp;
mod gcs;
mod handlers;
mod lifesciences;
mod monitor;
mod notifications;
mod notifier;
mod queue;
mod registry;
mod state;
mod storage;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::state::Application;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("dispatcher=debug,tower_http=info")),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    let port = config.port;

    // backends + driver + notifier
    let mut app = Application::build(config)
        .await
        .context("could not initialise backends")?;
    // monitor de reconciliacion en segundo plano
    app.start_monitor();

    // router HTTP
    let router = handlers::build_router(app.state());
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("could not bind port {port}"))?;
    info!("dispatcher listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    app.teardown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
