//! HTTP transport for `POST /contacts`.

use crate::{BrevoClientConfig, TransportError};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Raw HTTP outcome; classification happens in the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

/// Sends one create-or-update request.
#[async_trait]
pub trait ContactTransport: Send + Sync {
    async fn post_contact(&self, payload: &serde_json::Value)
        -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: Client,
    url: Url,
    api_key: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &BrevoClientConfig) -> Result<Self, TransportError> {
        let url = contacts_url(&config.base_url)?;
        let timeout = config.request_timeout();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            client,
            url,
            api_key: config.api_key.trim().to_string(),
            timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl ContactTransport for HttpTransport {
    async fn post_contact(
        &self,
        payload: &serde_json::Value,
    ) -> Result<TransportResponse, TransportError> {
        debug!(url = %self.url, "Sending Brevo request");

        let response = self
            .client
            .post(self.url.clone())
            .header("api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| self.map_error(e))?;
        Ok(TransportResponse { status, body })
    }
}

impl HttpTransport {
    fn map_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

/// `{base_url}/contacts`, tolerating a trailing slash on the base.
fn contacts_url(base_url: &str) -> Result<Url, TransportError> {
    let joined = format!("{}/contacts", base_url.trim().trim_end_matches('/'));
    Url::parse(&joined).map_err(|e| TransportError::InvalidConfig(format!("base_url {base_url:?}: {e}")))
}
