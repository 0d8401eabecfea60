//! HTTP messaging gateway client

use super::{MessagingTransport, SendReceipt, TransportError};
use async_trait::async_trait;
use bulkline_common::config::TransportConfig;
use bulkline_common::types::{DeviceId, MediaKind};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct StatusResponse {
    connected: bool,
}

#[derive(Debug, Serialize)]
struct TextRequest<'a> {
    to: &'a str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct MediaRequest<'a> {
    to: &'a str,
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(alias = "message")]
    error: String,
}

/// Client for a messaging gateway exposing per-device REST endpoints:
///
/// - `GET  /devices/{device}/status` -> `{"connected": bool}`
/// - `POST /devices/{device}/messages/text` with `{"to", "text"}`
/// - `POST /devices/{device}/messages/{kind}` with `{"to", "url", "caption"}`
///
/// Sends answer `{"to", "message_id"}`.
pub struct HttpTransport {
    config: TransportConfig,
    client: Client,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TransportError::Request(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    fn build_request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let mut request = self.client.request(method, &url);

        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        request
    }

    async fn rejected(response: Response) -> TransportError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_else(|e| {
            warn!("Failed to read gateway error body: {}", e);
            String::new()
        });
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        TransportError::Rejected { status, message }
    }

    async fn post_message<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<SendReceipt, TransportError> {
        let response = self
            .build_request(Method::POST, path)
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::rejected(response).await);
        }

        let receipt: SendReceipt = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;

        debug!(to = %receipt.to, message_id = %receipt.message_id, "Gateway accepted message");
        Ok(receipt)
    }
}

#[async_trait]
impl MessagingTransport for HttpTransport {
    async fn is_connected(&self, device: &DeviceId) -> Result<bool, TransportError> {
        let response = self
            .build_request(Method::GET, &format!("/devices/{}/status", device))
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(Self::rejected(response).await);
        }

        let status: StatusResponse = response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))?;
        Ok(status.connected)
    }

    async fn send_text(
        &self,
        device: &DeviceId,
        to: &str,
        text: &str,
    ) -> Result<SendReceipt, TransportError> {
        self.post_message(
            &format!("/devices/{}/messages/text", device),
            &TextRequest { to, text },
        )
        .await
    }

    async fn send_media(
        &self,
        kind: MediaKind,
        device: &DeviceId,
        to: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<SendReceipt, TransportError> {
        self.post_message(
            &format!("/devices/{}/messages/{}", device, kind),
            &MediaRequest { to, url, caption },
        )
        .await
    }
}
