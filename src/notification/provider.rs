use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use super::models::{Annotations, DeliveryStatusState, EventType};

/// key: webhook-provider-message
/// A message as the webhook provider knows it, optionally with per-channel delivery progress.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub namespace: String,
    pub event_id: Uuid,
    pub event_type: EventType,
    #[serde(default)]
    pub channels: Vec<Uuid>,
    #[serde(default)]
    pub annotations: Annotations,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_status: Option<Vec<ChannelDeliveryStatus>>,
}

impl Message {
    pub fn delivery_status_for(&self, channel_id: Uuid) -> Option<&ChannelDeliveryStatus> {
        self.delivery_status
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|status| status.channel_id == channel_id)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChannelDeliveryStatus {
    pub channel_id: Uuid,
    pub state: DeliveryStatusState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GetMessageInput {
    pub namespace: String,
    pub event_id: Uuid,
    pub expand_delivery_status: bool,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct SendMessageInput {
    #[serde(skip)]
    pub namespace: String,
    pub event_id: Uuid,
    pub event_type: EventType,
    pub channels: Vec<Uuid>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl SendMessageInput {
    /// Provider-side dedup key. Stable for the same event content and timestamp, so a resend
    /// after a crash between send and persist collapses onto the original message.
    pub fn idempotency_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.namespace.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.event_id.as_bytes());
        hasher.update(self.event_type.as_str().as_bytes());
        for channel in &self.channels {
            hasher.update(channel.as_bytes());
        }
        hasher.update(self.payload.to_string().as_bytes());
        hasher.update(self.timestamp.timestamp_micros().to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

/// key: webhook-provider-errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("message not found: {0}")]
    NotFound(String),
    #[error("message not ready: {0}")]
    MessageNotReady(String),
    #[error("unrecoverable provider error: {0}")]
    Unrecoverable(String),
    #[error("retryable provider error: {message}")]
    Retryable {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("webhook provider request failed: {0}")]
    Transport(#[from] anyhow::Error),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound(_))
    }

    pub fn is_message_not_ready(&self) -> bool {
        matches!(self, ProviderError::MessageNotReady(_))
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, ProviderError::Unrecoverable(_))
    }

    /// Back-off suggested by the provider, when it gave one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Retryable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// key: webhook-provider -> delivery broker integration
#[async_trait]
pub trait WebhookProvider: Send + Sync {
    async fn get_message(&self, input: GetMessageInput) -> Result<Message, ProviderError>;
    async fn send_message(&self, input: SendMessageInput) -> Result<Message, ProviderError>;
}
