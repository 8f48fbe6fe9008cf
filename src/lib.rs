//! Webhook ingestion core for the ComPilot compliance API.
//!
//! - [`rate_limiter`]: dual sliding-window gate for outbound API calls.
//! - [`verification`]: Svix-style HMAC signature checks on inbound deliveries.
//! - [`broadcaster`]: fan-out of verified events to live WebSocket clients.
//!
//! [`http_server`] wires them behind axum; [`upstream`] is the rate-limited
//! REST client.

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod http_server;
pub mod rate_limiter;
pub mod types;
pub mod upstream;
pub mod verification;
pub mod ws;

pub use broadcaster::{Broadcaster, ConnectionId, PublishReport, Subscriber};
pub use config::Config;
pub use error::ApiError;
pub use http_server::ServerState;
pub use rate_limiter::RateLimiter;
pub use types::WebhookDelivery;
pub use verification::{verify, SignatureVerdict, SignatureVerifier};
