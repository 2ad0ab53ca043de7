use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use calc_orchestrator::api::{self, HeaderAuthenticator};
use calc_orchestrator::config::{SchedulerConfig, ServerConfig, WorkerAgentConfig, log_dir_from_env};
use calc_orchestrator::logging;
use calc_orchestrator::orchestrator::{Orchestrator, spawn_sweeper};
use calc_orchestrator::store::{Database, LibSqlBackend};
use calc_orchestrator::workers::{LocalClient, OrchestratorClient, spawn_pool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = logging::init(log_dir_from_env().as_deref(), "calc-orchestrator.log");
    let server = ServerConfig::from_env().context("loading server config")?;
    let scheduler = SchedulerConfig::from_env();

    eprintln!("Calc orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://{}", server.bind_addr);
    eprintln!("   Push: ws://{}/ws", server.bind_addr);
    eprintln!("   Local workers: {}", server.local_workers);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::open(&server.db_path)
            .await
            .with_context(|| format!("opening database at {}", server.db_path))?,
    );
    info!(path = %server.db_path, "Database ready");

    // ── Orchestrator ─────────────────────────────────────────────────────
    let orchestrator = Orchestrator::new(scheduler, Some(db));
    orchestrator.recover().await?;
    let sweeper = spawn_sweeper(Arc::clone(&orchestrator));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let client: Arc<dyn OrchestratorClient> =
        Arc::new(LocalClient::new(Arc::clone(&orchestrator)));
    let agents = spawn_pool(
        client,
        &WorkerAgentConfig::from_env(),
        "local",
        server.local_workers,
        shutdown_rx,
    );

    // ── HTTP ─────────────────────────────────────────────────────────────
    if server.worker_token.is_none() {
        warn!("CALC_WORKER_TOKEN is not set; worker routes accept any caller");
    }
    let app = api::router(
        Arc::clone(&orchestrator),
        Arc::new(HeaderAuthenticator),
        server.worker_token.clone(),
    );
    let listener = tokio::net::TcpListener::bind(server.bind_addr)
        .await
        .with_context(|| format!("binding {}", server.bind_addr))?;
    info!(addr = %server.bind_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for agent in agents {
        let _ = agent.await;
    }
    sweeper.abort();
    info!("Stopped");
    Ok(())
}
