//! Thin client for the ComPilot REST API.
//!
//! Every request goes through [`RateLimiter::admit`] first.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use thiserror::Error;

use crate::config::UpstreamConfig;
use crate::rate_limiter::RateLimiter;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("COMPILOT_API_KEY is not configured")]
    MissingApiKey,

    #[error("ComPilot request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ComPilot API error {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("unexpected ComPilot response: {0}")]
    Shape(String),
}

pub struct UpstreamClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    limiter: Arc<RateLimiter>,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig, limiter: Arc<RateLimiter>) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            limiter,
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, UpstreamError> {
        let api_key = self.api_key.as_deref().ok_or(UpstreamError::MissingApiKey)?;

        self.limiter.admit().await;

        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(%method, %url, "calling ComPilot");

        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(api_key)
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, %url, "ComPilot returned an error");
            return Err(UpstreamError::Status { status, body });
        }

        Ok(response.json().await?)
    }

    /// `POST /transactions`
    pub async fn submit_transaction(&self, transaction: &Value) -> Result<Value, UpstreamError> {
        self.request(Method::POST, "/transactions", &[], Some(transaction))
            .await
    }

    /// `GET /customers?currentPage=..&limit=..`
    pub async fn list_customers(&self, page: u32, limit: u32) -> Result<Value, UpstreamError> {
        let query = [("currentPage", page.to_string()), ("limit", limit.to_string())];
        self.request(Method::GET, "/customers", &query, None).await
    }

    /// `GET /customers/{id}`
    pub async fn get_customer(&self, customer_id: &str) -> Result<Value, UpstreamError> {
        self.request(Method::GET, &format!("/customers/{customer_id}"), &[], None)
            .await
    }

    /// Walk every page of `/customers` until `totalCount` rows have been seen.
    pub async fn fetch_all_customers(&self, limit: u32) -> Result<Vec<Value>, UpstreamError> {
        let limit = limit.max(1);
        let mut customers = Vec::new();
        let mut page = 1;
        let mut seen: u64 = 0;

        loop {
            let response = self.list_customers(page, limit).await?;
            let rows = response
                .get("data")
                .and_then(Value::as_array)
                .ok_or_else(|| UpstreamError::Shape("missing `data` array".to_string()))?;
            let total = response
                .get("totalCount")
                .and_then(Value::as_u64)
                .ok_or_else(|| UpstreamError::Shape("missing `totalCount`".to_string()))?;

            seen += rows.len() as u64;
            customers.extend(rows.iter().cloned());
            tracing::info!(seen, total, "fetched customer page");

            if rows.is_empty() || seen >= total {
                break;
            }
            page += 1;
        }

        Ok(customers)
    }
}
