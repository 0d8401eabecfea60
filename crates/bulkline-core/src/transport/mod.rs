//! Messaging transport - the outbound side of a send

mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use bulkline_common::types::{DeviceId, MediaKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Provider acknowledgement of one accepted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub to: String,
    pub message_id: String,
}

/// Transport errors. The display text is what gets stored on a failed
/// recipient.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Device {0} is not connected")]
    Disconnected(DeviceId),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Gateway rejected the message ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Send timed out after {0}s")]
    Timeout(u64),

    #[error("Invalid gateway response: {0}")]
    InvalidResponse(String),
}

impl From<TransportError> for bulkline_common::Error {
    fn from(e: TransportError) -> Self {
        bulkline_common::Error::Transport(e.to_string())
    }
}

/// Rate-limited external messaging provider
#[async_trait]
pub trait MessagingTransport: Send + Sync {
    /// Whether the device session is up and able to send
    async fn is_connected(&self, device: &DeviceId) -> Result<bool, TransportError>;

    async fn send_text(
        &self,
        device: &DeviceId,
        to: &str,
        text: &str,
    ) -> Result<SendReceipt, TransportError>;

    /// Send an attachment of `kind` fetched from `url`, with an optional
    /// caption
    async fn send_media(
        &self,
        kind: MediaKind,
        device: &DeviceId,
        to: &str,
        url: &str,
        caption: Option<&str>,
    ) -> Result<SendReceipt, TransportError>;
}
