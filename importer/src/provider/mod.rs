//! Client for the third-party telematics API.

pub mod extract;

use crate::rate_limiter::{RateLimitError, RateLimiter};
use crate::types::Vehicle;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned HTTP {status}")]
    Status { status: StatusCode },

    #[error("provider error {code}: {message}")]
    Provider { code: i64, message: String },

    #[error("could not decode provider response: {0}")]
    Decode(String),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    #[error("invalid provider URL: {0}")]
    InvalidUrl(String),
}

/// Response envelope shared by every provider endpoint. `status == 0` means
/// success.
#[derive(Deserialize, Debug)]
struct Envelope {
    status: i64,
    #[serde(default, alias = "msg")]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    fn into_data(self) -> Result<Value, ProviderError> {
        if self.status == 0 {
            Ok(self.data)
        } else {
            Err(ProviderError::Provider {
                code: self.status,
                message: self
                    .message
                    .unwrap_or_else(|| "no message from provider".into()),
            })
        }
    }
}

#[async_trait]
pub trait VehicleProvider: Send + Sync {
    /// Fetches and normalizes the vehicle inventory of one external user.
    async fn fetch_vehicles(
        &self,
        username: &str,
        limiter: &RateLimiter,
    ) -> Result<Vec<Vehicle>, ProviderError>;

    /// Attaches last-known positions. Never fails: on any error the vehicles
    /// are returned unchanged.
    async fn enrich_with_positions(
        &self,
        vehicles: Vec<Vehicle>,
        limiter: &RateLimiter,
    ) -> Vec<Vehicle>;
}

pub struct HttpProvider {
    client: reqwest::Client,
    monitors_url: Url,
    positions_url: Url,
    admin_token: String,
}

impl HttpProvider {
    pub fn new(base_url: &Url, admin_token: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpProvider {
            client,
            monitors_url: Self::endpoint(base_url, "api/v1/monitors")?,
            positions_url: Self::endpoint(base_url, "api/v1/positions")?,
            admin_token: admin_token.to_string(),
        })
    }

    fn endpoint(base_url: &Url, path: &str) -> Result<Url, ProviderError> {
        let base = format!("{}/", base_url.as_str().trim_end_matches('/'));
        Url::parse(&base)
            .and_then(|base| base.join(path))
            .map_err(|e| ProviderError::InvalidUrl(e.to_string()))
    }

    /// Sends a request after taking a limiter token and decodes the envelope.
    /// The call duration is fed back to the limiter whatever the outcome.
    async fn call(
        &self,
        request: reqwest::RequestBuilder,
        limiter: &RateLimiter,
    ) -> Result<Value, ProviderError> {
        limiter.acquire(1).await?;

        let started = Instant::now();
        let result = self.send(request).await;
        limiter.record_latency(started.elapsed());
        result
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, ProviderError> {
        let response = request.bearer_auth(&self.admin_token).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status { status });
        }

        let body = response.bytes().await?;
        let envelope: Envelope =
            serde_json::from_slice(&body).map_err(|e| ProviderError::Decode(e.to_string()))?;
        envelope.into_data()
    }
}

#[async_trait]
impl VehicleProvider for HttpProvider {
    async fn fetch_vehicles(
        &self,
        username: &str,
        limiter: &RateLimiter,
    ) -> Result<Vec<Vehicle>, ProviderError> {
        let request = self
            .client
            .get(self.monitors_url.clone())
            .query(&[("username", username)]);

        let data = self.call(request, limiter).await?;
        let vehicles = extract::normalize_vehicles(&data);
        tracing::debug!(username, count = vehicles.len(), "fetched provider vehicles");
        Ok(vehicles)
    }

    async fn enrich_with_positions(
        &self,
        vehicles: Vec<Vehicle>,
        limiter: &RateLimiter,
    ) -> Vec<Vehicle> {
        if vehicles.is_empty() {
            return vehicles;
        }

        let device_ids: Vec<&str> = vehicles.iter().map(|v| v.device_id.as_str()).collect();
        let request = self
            .client
            .post(self.positions_url.clone())
            .json(&serde_json::json!({ "device_ids": device_ids }));

        let positions = match self.call(request, limiter).await {
            Ok(data) => extract::decode_positions(&data),
            Err(e) => {
                tracing::warn!(error = %e, "position lookup failed, keeping vehicles without positions");
                return vehicles;
            }
        };

        match positions {
            Some(positions) => extract::merge_positions(vehicles, positions),
            None => {
                tracing::warn!("position payload is not a list, keeping vehicles without positions");
                vehicles
            }
        }
    }
}
