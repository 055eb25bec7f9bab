//! Home Assistant REST API client.
//!
//! The bridge only needs two call shapes: firing an event on the bus
//! (`POST /api/events/{event_type}`) and invoking a service
//! (`POST /api/services/{domain}/{service}`). Sinks talk to the narrow
//! [`HaApi`] trait so tests can substitute a recording stub.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Client-side timeout applied to every request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum HaError {
    /// Home Assistant answered with status >= 400; carries the response body.
    #[error("HA API rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("HA API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The two Home Assistant capabilities the sinks rely on.
#[async_trait]
pub trait HaApi: Send + Sync {
    /// Fire a named event on the Home Assistant event bus.
    async fn fire_event(&self, event_type: &str, payload: Value) -> Result<(), HaError>;

    /// Invoke `domain.service` with the given JSON body.
    async fn call_service(&self, domain: &str, service: &str, body: Value) -> Result<(), HaError>;
}

pub struct HaClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HaClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, HaError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
        })
    }

    async fn post(&self, path: &str, body: Value) -> Result<(), HaError> {
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(HaError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl HaApi for HaClient {
    async fn fire_event(&self, event_type: &str, payload: Value) -> Result<(), HaError> {
        self.post(&format!("/api/events/{event_type}"), payload).await
    }

    async fn call_service(&self, domain: &str, service: &str, body: Value) -> Result<(), HaError> {
        self.post(&format!("/api/services/{domain}/{service}"), body)
            .await
    }
}
