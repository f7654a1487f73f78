use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use mysql_replay::config;
use mysql_replay::metrics::serve_metrics;
use mysql_replay::mock::{load_mocks, MockStore};
use mysql_replay::proxy::{usage_reporter, ReplayProxy, TaskService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = config::load_or_default();

    let mocks = match &config.replay.mocks_path {
        Some(path) => load_mocks(path)?,
        None => {
            warn!("No mocks_path configured; every connection will fail the handshake");
            Vec::new()
        }
    };
    let store = Arc::new(MockStore::from_mocks(mocks));
    info!(
        handshake = store.unfiltered_len(),
        commands = store.filtered_len(),
        "Mock store ready"
    );

    let cancel = CancellationToken::new();
    let mut proxy = ReplayProxy::bind(config.server.addr(), store.clone(), cancel.clone())
        .await?
        .with_shutdown_grace(config.replay.shutdown_grace());

    if let Some(every) = config.replay.report_interval() {
        proxy.add_service(usage_reporter(store.clone(), every));
    }
    if let Some(addr) = &config.metrics.listen_addr {
        let listener = TcpListener::bind(addr).await?;
        let token = cancel.child_token();
        proxy.add_service(TaskService::spawn("metrics", async move {
            if let Err(e) = serve_metrics(listener, token).await {
                warn!(error = %e, "Metrics server stopped");
            }
        }));
    }

    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        signal.cancel();
    });

    proxy.run().await?;

    let report = proxy.shutdown().await;
    for failure in &report.failures {
        warn!(resource = %failure.resource, error = %failure.error, "Release failed");
    }

    let unused = store.unused_filtered();
    if !unused.is_empty() {
        warn!(count = unused.len(), mocks = ?unused, "Recorded commands never replayed");
    }
    info!(consumed = store.consumed_count(), "Done");
    Ok(())
}
