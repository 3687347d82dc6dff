//! SFU 시그널링 / 미디어 라우팅 코디네이터

mod codecs;
mod config;
mod error;
mod handlers;
mod protocol;
mod server;
mod state;

use anyhow::Context;
use config::Config;
use mediasoup::prelude::WorkerManager;
use state::SignalingState;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    // 로깅 초기화
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let worker_manager = WorkerManager::new();
    let worker = handlers::setup_server(&worker_manager, &config)
        .await
        .context("failed to start media worker")?;

    // 워커가 죽으면 프로세스를 내린다
    tokio::spawn(handlers::watch_worker(
        handlers::worker_died(&worker),
        Duration::from_millis(config.worker.death_grace_ms),
        |code| std::process::exit(code),
    ));

    let state = Arc::new(SignalingState::new(config.clone(), worker_manager, worker));

    // 유휴 피어 정리 스케줄러
    let reaper_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(reaper_state.config.peer.reap_interval_ms.max(1)));
        loop {
            interval.tick().await;
            handlers::cleanup_idle_peers(&reaper_state);
        }
    });

    let app = server::app(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    tracing::info!("SFU signaling server started");
    tracing::info!("Address: {}", addr);
    tracing::info!("WebSocket: ws://{}/ws", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
