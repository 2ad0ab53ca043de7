//! Standalone worker process. Connects to a running orchestrator over HTTP.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use calc_orchestrator::config::{WorkerAgentConfig, log_dir_from_env};
use calc_orchestrator::logging;
use calc_orchestrator::workers::{HttpClient, OrchestratorClient, spawn_pool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = logging::init(log_dir_from_env().as_deref(), "calc-worker.log");
    let config = WorkerAgentConfig::from_env();

    let prefix = config.worker_id.clone().unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("worker-{}", &id[..8])
    });
    info!(
        server = %config.server_url,
        prefix = %prefix,
        count = config.worker_count,
        "Starting workers"
    );

    let client: Arc<dyn OrchestratorClient> = Arc::new(
        HttpClient::new(config.server_url.clone()).with_token(config.worker_token.clone()),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let agents = spawn_pool(client, &config, &prefix, config.worker_count, shutdown_rx);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    for agent in agents {
        let _ = agent.await;
    }
    Ok(())
}
