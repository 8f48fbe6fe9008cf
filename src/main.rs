use compilot_relay::config::Config;
use compilot_relay::http_server::{self, ServerState};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if config.webhook_secret.is_none() {
        warn!("WEBHOOK_SECRET is not set; webhook signatures will not be verified");
    }
    if config.upstream.api_key.is_none() {
        warn!("COMPILOT_API_KEY is not set; /api/transactions will fail");
    }

    let addr = config.bind_address();
    let heartbeat = config.broadcast.heartbeat_interval;
    let idle_timeout = config.broadcast.idle_timeout;
    let state = ServerState::new(config)?;

    let sweep = state.broadcaster.spawn_idle_sweep(heartbeat, idle_timeout);

    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "compilot-relay listening");

    http_server::serve(listener, state, shutdown_signal()).await?;
    sweep.abort();

    info!("compilot-relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
