use crate::broadcaster::Broadcaster;
use crate::config::Config;
use crate::error::{ApiError, ApiResult};
use crate::rate_limiter::RateLimiter;
use crate::types::WebhookDelivery;
use crate::upstream::{UpstreamClient, UpstreamError};
use crate::verification::{SignatureVerdict, SignatureVerifier};
use crate::ws::ws_handler;
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Everything the handlers share. Built once at startup and torn down by
/// [`ServerState::shutdown`].
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub verifier: Arc<SignatureVerifier>,
    pub broadcaster: Arc<Broadcaster>,
    pub upstream: Arc<UpstreamClient>,
}

impl ServerState {
    pub fn new(config: Config) -> Result<Self, UpstreamError> {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit));
        let upstream = UpstreamClient::new(&config.upstream, limiter)?;
        Ok(Self {
            verifier: Arc::new(SignatureVerifier::new(config.webhook_secret.clone())),
            broadcaster: Arc::new(Broadcaster::new(&config.broadcast)),
            upstream: Arc::new(upstream),
            config: Arc::new(config),
        })
    }

    pub async fn shutdown(&self) {
        self.broadcaster.shutdown().await;
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/api/webhooks/compilot", post(handle_webhook))
        // Root alias for tunnels that can only target `/`.
        .route("/", post(handle_webhook))
        .route("/api/transactions", post(submit_transaction))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: ServerState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            state.shutdown().await;
        })
        .await
}

/// Bind `addr` and serve in the background. Returns the bound address,
/// which is how callers learn the port when binding to `:0`.
pub async fn start(state: ServerState, addr: &str) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(%local, "HTTP server bound");

    tokio::spawn(async move {
        if let Err(e) = serve(listener, state, std::future::pending()).await {
            warn!(error = %e, "HTTP server error");
        }
    });

    Ok(local)
}

async fn handle_webhook(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let delivery = WebhookDelivery::from_request(&headers, body)?;
    let delivery_id = delivery.id().unwrap_or("-").to_string();

    match state.verifier.verify(&delivery) {
        SignatureVerdict::Valid => debug!(%delivery_id, "webhook signature verified"),
        SignatureVerdict::VerificationSkipped => {
            warn!(%delivery_id, "WEBHOOK_SECRET not set, accepting unverified delivery")
        }
        verdict @ (SignatureVerdict::InvalidSignature | SignatureVerdict::MissingHeaders) => {
            warn!(%delivery_id, %verdict, "rejecting webhook delivery");
            return Err(ApiError::InvalidSignature);
        }
    }

    let report = state.broadcaster.publish(delivery.payload()).await;
    info!(
        %delivery_id,
        delivered = report.delivered,
        pruned = report.pruned,
        "webhook broadcast"
    );

    Ok(Json(json!({ "status": "ok" })))
}

async fn submit_transaction(State(state): State<ServerState>, body: Bytes) -> ApiResult<Json<Value>> {
    let transaction: Value = serde_json::from_slice(&body)?;
    let response = state.upstream.submit_transaction(&transaction).await?;
    Ok(Json(response))
}

async fn health(State(state): State<ServerState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "subscribers": state.broadcaster.subscriber_count().await,
    }))
}
