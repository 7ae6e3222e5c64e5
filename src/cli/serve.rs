//! `convert2pdf serve`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use crate::cli::ServeArgs;
use crate::config::Config;
use crate::formats::SupportedFormats;
use crate::job::purge_staging_root;
use crate::orchestrator::{HttpServer, IngressApi, JobOrchestrator, TempFileBridge};
use crate::storage::{ArtifactStore, S3Store};
use crate::worker::{WorkerLifecycleManager, container_env};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

impl ServeArgs {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.server.host = host;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(port) = self.bridge_port {
            config.server.bridge_port = port;
        }
        if let Some(backend) = self.backend {
            config.worker.backend = backend;
        }
        if let Some(dir) = self.staging_dir {
            config.server.staging_dir = dir;
        }
    }
}

pub(super) async fn run_serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = Config::from_env().context("Invalid configuration")?;
    args.apply(&mut config);
    let config = Arc::new(config);

    tracing::info!(
        backend = %config.worker.backend,
        staging_dir = %config.server.staging_dir.display(),
        storage = %config.storage.endpoint_url,
        "Starting conversion server"
    );

    match purge_staging_root(&config.server.staging_dir).await {
        Ok(0) => {}
        Ok(n) => tracing::info!("Purged {} stale staging entries", n),
        Err(e) => tracing::warn!("Could not purge staging directory: {}", e),
    }

    let store: Arc<dyn ArtifactStore> =
        Arc::new(S3Store::new(config.storage.clone()).context("Failed to create storage client")?);
    if let Err(e) = store.ensure_ready().await {
        tracing::error!("Storage is unusable: {}", e);
        tracing::warn!("Continuing startup, uploads may fail until storage is reachable");
    }

    let workers = WorkerLifecycleManager::initialize(
        config.worker.clone(),
        container_env(&config.storage),
    )
    .await
    .context("Failed to initialize workers")?;

    let bridge = TempFileBridge::new(config.server.bridge_base_url());
    let orchestrator = Arc::new(JobOrchestrator::new(
        Arc::clone(&config),
        Arc::new(SupportedFormats::standard()),
        Arc::new(workers),
        store,
        bridge.clone(),
    )?);

    let mut ingress = HttpServer::new(
        "Ingress API",
        SocketAddr::new(config.server.host, config.server.port),
        IngressApi::router(Arc::clone(&orchestrator), config.server.max_upload_bytes),
    );
    ingress.start().await?;

    // Subprocess workers read staged files directly and never need the bridge.
    let mut bridge_server = if config.worker.backend.needs_bridge() {
        let mut server = HttpServer::new(
            "File bridge",
            SocketAddr::new(config.server.bridge_bind, config.server.bridge_port),
            bridge.router(),
        );
        server.start().await?;
        tracing::info!(url = %bridge.base_url(), "Workers fetch staged files from the bridge");
        Some(server)
    } else {
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    // Jobs still running after the grace period are dropped with the runtime;
    // their staging and worker guards clean up.
    if tokio::time::timeout(SHUTDOWN_GRACE, ingress.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("In-flight requests did not finish within {:?}, abandoning them", SHUTDOWN_GRACE);
    }
    if let Some(server) = bridge_server.as_mut() {
        server.shutdown().await;
    }

    tracing::info!(
        leased_workers = orchestrator.workers().leased_count(),
        "Server stopped"
    );
    Ok(())
}
