use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type Annotations = Map<String, Value>;

/// key: notification-event-type
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    #[serde(rename = "entitlements.balance.threshold")]
    BalanceThreshold,
    #[serde(rename = "entitlements.reset")]
    EntitlementReset,
    #[serde(rename = "invoice.created")]
    InvoiceCreated,
    #[serde(rename = "invoice.updated")]
    InvoiceUpdated,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::BalanceThreshold => "entitlements.balance.threshold",
            EventType::EntitlementReset => "entitlements.reset",
            EventType::InvoiceCreated => "invoice.created",
            EventType::InvoiceUpdated => "invoice.updated",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "entitlements.balance.threshold" => Some(Self::BalanceThreshold),
            "entitlements.reset" => Some(Self::EntitlementReset),
            "invoice.created" => Some(Self::InvoiceCreated),
            "invoice.updated" => Some(Self::InvoiceUpdated),
            _ => None,
        }
    }
}

/// key: notification-channel-type
/// Only webhook channels are reconciled; anything else is carried through as `Other`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Webhook,
    Other(String),
}

impl ChannelType {
    pub fn as_str(&self) -> &str {
        match self {
            ChannelType::Webhook => "webhook",
            ChannelType::Other(kind) => kind.as_str(),
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "webhook" => ChannelType::Webhook,
            other => ChannelType::Other(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub channel_type: ChannelType,
}

/// key: notification-rule
/// The rule that produced an event, with the channels it fans out to.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub id: Uuid,
    pub namespace: String,
    pub name: String,
    pub channels: Vec<Channel>,
}

impl Rule {
    pub fn channel(&self, channel_id: Uuid) -> Option<&Channel> {
        self.channels.iter().find(|channel| channel.id == channel_id)
    }
}

/// key: notification-delivery-state
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatusState {
    Pending,
    Resending,
    Sending,
    Failed,
    Success,
}

impl DeliveryStatusState {
    pub const ACTIVE: [DeliveryStatusState; 3] = [
        DeliveryStatusState::Pending,
        DeliveryStatusState::Resending,
        DeliveryStatusState::Sending,
    ];

    /// Processing order within one event, lowest first. Terminal states share the last slot.
    pub fn priority(&self) -> u8 {
        match self {
            DeliveryStatusState::Pending => 0,
            DeliveryStatusState::Resending => 1,
            DeliveryStatusState::Sending => 2,
            DeliveryStatusState::Failed | DeliveryStatusState::Success => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryStatusState::Failed | DeliveryStatusState::Success
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatusState::Pending => "pending",
            DeliveryStatusState::Resending => "resending",
            DeliveryStatusState::Sending => "sending",
            DeliveryStatusState::Failed => "failed",
            DeliveryStatusState::Success => "success",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "resending" => Some(Self::Resending),
            "sending" => Some(Self::Sending),
            "failed" => Some(Self::Failed),
            "success" => Some(Self::Success),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeliveryStatusState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// key: notification-delivery-reason
/// Why a delivery status was parked or failed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeliveryReason {
    /// Stuck in `Sending` past the sending timeout: the recipient kept failing.
    #[serde(rename = "user-send-attempts-exhausted")]
    UserSendAttemptsExhausted,
    /// Stuck in `Pending` past the pending timeout: never handed off to the provider.
    #[serde(rename = "system-dispatch-exhausted")]
    SystemDispatchExhausted,
    #[serde(rename = "system-recoverable")]
    SystemRecoverable,
    #[serde(rename = "system-unrecoverable")]
    SystemUnrecoverable,
}

impl DeliveryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryReason::UserSendAttemptsExhausted => "user-send-attempts-exhausted",
            DeliveryReason::SystemDispatchExhausted => "system-dispatch-exhausted",
            DeliveryReason::SystemRecoverable => "system-recoverable",
            DeliveryReason::SystemUnrecoverable => "system-unrecoverable",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "user-send-attempts-exhausted" => Some(Self::UserSendAttemptsExhausted),
            "system-dispatch-exhausted" => Some(Self::SystemDispatchExhausted),
            "system-recoverable" => Some(Self::SystemRecoverable),
            "system-unrecoverable" => Some(Self::SystemUnrecoverable),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeliveryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// key: notification-delivery-status
/// Delivery progress of one event towards one channel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DeliveryStatus {
    pub namespace: String,
    pub id: Uuid,
    pub event_id: Uuid,
    pub channel_id: Uuid,
    pub state: DeliveryStatusState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DeliveryReason>,
    #[serde(default)]
    pub annotations: Annotations,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// key: notification-event
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: Uuid,
    pub namespace: String,
    pub event_type: EventType,
    pub created_at: DateTime<Utc>,
    pub payload: Value,
    pub rule: Rule,
    #[serde(default)]
    pub annotations: Annotations,
    #[serde(default)]
    pub delivery_status: Vec<DeliveryStatus>,
}

impl Event {
    /// Envelope handed to the webhook provider when the event is sent.
    pub fn webhook_payload(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "type": self.event_type.as_str(),
            "namespace": self.namespace,
            "created_at": self.created_at,
            "rule": {
                "id": self.rule.id,
                "name": self.rule.name,
            },
            "data": self.payload,
        })
    }
}

/// key: notification-delivery-status-update
/// Full replacement of the mutable fields of one delivery status.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateEventDeliveryStatusInput {
    pub namespace: String,
    pub id: Uuid,
    pub event_id: Uuid,
    pub channel_id: Uuid,
    pub state: DeliveryStatusState,
    pub reason: Option<DeliveryReason>,
    pub annotations: Annotations,
    pub next_attempt: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl UpdateEventDeliveryStatusInput {
    /// Starts from the current values of `status`; callers override what changes.
    pub fn from_status(status: &DeliveryStatus) -> Self {
        Self {
            namespace: status.namespace.clone(),
            id: status.id,
            event_id: status.event_id,
            channel_id: status.channel_id,
            state: status.state,
            reason: status.reason,
            annotations: status.annotations.clone(),
            next_attempt: status.next_attempt,
            attempts: status.attempts,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    /// 1-based.
    pub page_number: u32,
    /// Zero means no limit.
    pub page_size: u32,
}

impl Page {
    pub fn all() -> Self {
        Self {
            page_number: 1,
            page_size: 0,
        }
    }

    pub fn new(page_number: u32, page_size: u32) -> Self {
        Self {
            page_number: page_number.max(1),
            page_size,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.page_size == 0
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page_number.saturating_sub(1)) * u64::from(self.page_size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ListEventsInput {
    /// Empty means every namespace.
    pub namespaces: Vec<String>,
    pub delivery_status_states: Vec<DeliveryStatusState>,
    pub page: Page,
}

#[derive(Clone, Debug)]
pub struct PagedResponse<T> {
    pub items: Vec<T>,
    pub total_count: u64,
    pub page: Page,
}
