//! HTTP client for the prediction service
//!
//! The gateway forwards the request body unchanged and hands the JSON
//! result back without interpreting it.

use reqwest::{header::CONTENT_TYPE, Client};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Inference provider errors
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Inference service returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Inference service not configured: {0}")]
    NotConfigured(String),
}

/// Client for `POST {base_url}/predict`
#[derive(Clone)]
pub struct InferenceClient {
    client: Client,
    predict_url: String,
}

impl InferenceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InferenceError> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(InferenceError::NotConfigured("empty base URL".to_string()));
        }
        url::Url::parse(base_url)
            .map_err(|e| InferenceError::NotConfigured(format!("invalid URL {}: {}", base_url, e)))?;

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("keygate/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            predict_url: format!("{}/predict", base_url),
        })
    }

    pub fn predict_url(&self) -> &str {
        &self.predict_url
    }

    /// Run one prediction on the given payload
    pub async fn infer(
        &self,
        payload: Vec<u8>,
        content_type: &str,
    ) -> Result<serde_json::Value, InferenceError> {
        debug!(bytes = payload.len(), content_type, "Forwarding prediction request");

        let response = self
            .client
            .post(&self.predict_url)
            .header(CONTENT_TYPE, content_type)
            .body(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Inference service rejected request");
            return Err(InferenceError::Upstream {
                status: status.as_u16(),
                message: message.chars().take(500).collect(),
            });
        }

        Ok(response.json().await?)
    }
}
