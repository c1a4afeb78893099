use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use render_job_engine::config::ServiceConfig;
use render_job_engine::engine::invoker::ProcessEngine;
use render_job_engine::engine::pipeline::{Collaborators, Orchestrator};
use render_job_engine::server::handler::RenderServer;
use render_job_engine::source::http_source::HttpSource;
use render_job_engine::submit::batch::GoogleBatchSubmitter;
use render_job_engine::submit::notify::HttpNotifier;
use render_job_engine::submit::storage::{GcsObjectStore, MountedBucketStore, ObjectStore};
use render_job_engine::telemetry::init_tracing;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::var_os("RENDER_CONFIG").map(PathBuf::from);
    let config = Arc::new(ServiceConfig::load(config_path.as_deref())?);
    info!(
        "config loaded work_root={} engine={} bucket={}",
        config.work_root.display(),
        config.engine_executable.display(),
        config.bucket
    );

    let store: Arc<dyn ObjectStore> = match &config.storage_mount {
        Some(mount) => Arc::new(MountedBucketStore::new(mount, &config.bucket)),
        None => Arc::new(GcsObjectStore::new(&config.bucket, config.access_token.clone())),
    };
    let collaborators = Collaborators {
        source: Arc::new(HttpSource::with_connect_timeout(HashMap::new(), CONNECT_TIMEOUT)?),
        engine: Arc::new(ProcessEngine::new(&config.engine_executable)),
        store,
        batch: Arc::new(GoogleBatchSubmitter::from_config(&config)),
        notifier: Arc::new(HttpNotifier::new()),
    };
    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&config), collaborators));

    let server = RenderServer::start(&config.bind_addr, orchestrator).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}
