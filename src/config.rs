//! Environment-sourced configuration.
//!
//! Values are read once at startup. A `.env` file in the working directory
//! is loaded first if present; real environment variables win over it.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// `whsec_`-prefixed base64 signing secret. `None` disables verification.
    pub webhook_secret: Option<String>,
    pub rate_limit: RateLimitConfig,
    pub broadcast: BroadcastConfig,
    pub upstream: UpstreamConfig,
}

/// Dual-window budget for outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub per_second: usize,
    pub per_minute: usize,
    pub poll_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 15,
            per_minute: 300,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Subscriber fan-out settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastConfig {
    /// Outbound frames buffered per connection before `publish` waits.
    pub queue_size: usize,
    /// How long `publish` waits on one connection before pruning it.
    pub send_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Connections silent for longer than this are dropped by the sweep.
    pub idle_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            queue_size: 64,
            send_timeout: Duration::from_millis(5000),
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.compilot.ai".to_string(),
            api_key: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            webhook_secret: None,
            rate_limit: RateLimitConfig::default(),
            broadcast: BroadcastConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl Config {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unset keys keep their
    /// defaults; set but unparseable keys are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let rate_limit = RateLimitConfig {
            per_second: parse_or(&get, "RATE_LIMIT_PER_SECOND", defaults.rate_limit.per_second)?,
            per_minute: parse_or(&get, "RATE_LIMIT_PER_MINUTE", defaults.rate_limit.per_minute)?,
            poll_interval: millis_or(&get, "RATE_LIMIT_POLL_MS", defaults.rate_limit.poll_interval)?,
        };

        let broadcast = BroadcastConfig {
            queue_size: parse_or(&get, "WS_QUEUE_SIZE", defaults.broadcast.queue_size)?,
            send_timeout: millis_or(&get, "WS_SEND_TIMEOUT_MS", defaults.broadcast.send_timeout)?,
            // tokio intervals reject a zero period.
            heartbeat_interval: secs_or(
                &get,
                "WS_HEARTBEAT_SECS",
                defaults.broadcast.heartbeat_interval,
            )?
            .max(Duration::from_secs(1)),
            idle_timeout: secs_or(&get, "WS_IDLE_TIMEOUT_SECS", defaults.broadcast.idle_timeout)?,
        };

        Ok(Self {
            host: get("HOST").unwrap_or(defaults.host),
            port: parse_or(&get, "PORT", defaults.port)?,
            webhook_secret: get("WEBHOOK_SECRET"),
            rate_limit,
            broadcast,
            upstream: UpstreamConfig {
                base_url: get("COMPILOT_API_URL").unwrap_or(defaults.upstream.base_url),
                api_key: get("COMPILOT_API_KEY"),
            },
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T, F>(get: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn millis_or<F>(get: &F, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(get, var, default.as_millis() as u64).map(Duration::from_millis)
}

fn secs_or<F>(get: &F, var: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(get, var, default.as_secs()).map(Duration::from_secs)
}
