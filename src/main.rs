mod config;
mod db;
mod frame;
mod gateway;
mod grid;
mod ledger;
mod repo;
mod rooms;
mod routes;
mod services;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::repo::CanvasRepo;
use crate::repo::memory::MemoryRepo;
use crate::repo::postgres::PgCanvasRepo;

/// Upper bound on waiting for queued history writes at shutdown.
const HISTORY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env();

    let repo: Arc<dyn CanvasRepo> = match &config.database_url {
        Some(database_url) => {
            let pool = db::init_pool(database_url, config.db_max_connections)
                .await
                .expect("database init failed");
            Arc::new(PgCanvasRepo::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set; canvases live in memory only");
            Arc::new(MemoryRepo::new())
        }
    };

    let mut state = state::AppState::new(repo.clone(), config.limits, config.client_channel_capacity);
    let (history_tx, history_worker) = services::persistence::spawn_history_worker(repo, config.history);
    state.history_tx = Some(history_tx);

    if config.seed_community_pubs {
        let created = services::canvas::seed_community_pubs(&state)
            .await
            .expect("community pub seeding failed");
        info!(created, "community pubs ready");
    }

    // Spawn background grid flush.
    let persistence = services::persistence::spawn_persistence_task(state.clone(), config.canvas_flush_interval);

    let app = routes::app(state.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("failed to bind");

    info!(port = config.port, "pixelpub listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server failed");

    // Upgraded sockets outlive `serve`: cut them off so no write can commit
    // after the final flush.
    let closed = state.gateway.close_all();
    info!(closed, "websocket sessions closed");

    persistence.abort();
    let flushed = services::persistence::flush_all_dirty(&state).await;
    info!(flushed, "final canvas flush complete");
    if !history_worker.shutdown(HISTORY_DRAIN_TIMEOUT).await {
        warn!("history queue did not drain before shutdown");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received; draining");
}
