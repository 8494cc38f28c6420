use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

mod app;
mod http;
mod layers;
mod logfmt;
mod pipeline;
mod upstream;
mod usage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // LOG_LEVEL overrides RUST_LOG; structured JSON lines for the log sink
    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "kiro_gateway=info,kiro_auth=info,kiro_pool=info,kiro_wire=info".into());
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let config_path = std::env::var("KIRO_CONFIG").ok();
    let config = kiro_core::config::GatewayConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "config load failed, using defaults");
        kiro_core::config::GatewayConfig::default()
    });

    let bind = config.server.bind.clone();
    let port = config.server.port;

    let shutdown = CancellationToken::new();
    let state = Arc::new(app::AppState::load(config, shutdown.clone())?);

    // background workers: token keep-alive, usage drainer
    let _keepalive = state.accounts.start_keep_alive();

    let router = app::build_router(state.clone());
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, accounts = state.accounts.len().await, "kiro gateway listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await?;

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    shutdown.cancel();
}
