//! In-memory collaborators for exercising the reconciler without Postgres or a live provider.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::clock::Clock;
use super::models::{
    DeliveryStatus, DeliveryStatusState, Event, ListEventsInput, PagedResponse,
    UpdateEventDeliveryStatusInput,
};
use super::provider::{
    ChannelDeliveryStatus, GetMessageInput, Message, ProviderError, SendMessageInput,
    WebhookProvider,
};
use super::repository::{EventRepository, RepositoryError};

pub struct FixedClock {
    now: StdMutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: StdMutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
pub struct InMemoryEventRepository {
    events: Mutex<Vec<Event>>,
    updates: Mutex<Vec<UpdateEventDeliveryStatusInput>>,
    failing_events: Mutex<HashSet<Uuid>>,
    list_failure: Mutex<Option<String>>,
}

impl InMemoryEventRepository {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events: Mutex::new(events),
            ..Default::default()
        }
    }

    pub async fn insert(&self, event: Event) {
        self.events.lock().await.push(event);
    }

    pub async fn event(&self, id: Uuid) -> Option<Event> {
        self.events
            .lock()
            .await
            .iter()
            .find(|event| event.id == id)
            .cloned()
    }

    pub async fn delivery_status(&self, id: Uuid) -> Option<DeliveryStatus> {
        self.events
            .lock()
            .await
            .iter()
            .flat_map(|event| event.delivery_status.iter())
            .find(|status| status.id == id)
            .cloned()
    }

    /// Every update applied (or attempted), in call order.
    pub async fn updates(&self) -> Vec<UpdateEventDeliveryStatusInput> {
        self.updates.lock().await.clone()
    }

    /// Makes every delivery status update of `event_id` fail.
    pub async fn fail_updates_for(&self, event_id: Uuid) {
        self.failing_events.lock().await.insert(event_id);
    }

    pub async fn fail_listing(&self, message: &str) {
        *self.list_failure.lock().await = Some(message.to_string());
    }
}

#[async_trait]
impl EventRepository for InMemoryEventRepository {
    async fn list_events(
        &self,
        input: ListEventsInput,
    ) -> Result<PagedResponse<Event>, RepositoryError> {
        if let Some(message) = self.list_failure.lock().await.clone() {
            return Err(RepositoryError::Message(message));
        }

        let matching: Vec<Event> = self
            .events
            .lock()
            .await
            .iter()
            .filter(|event| {
                input.namespaces.is_empty() || input.namespaces.contains(&event.namespace)
            })
            .filter(|event| {
                input.delivery_status_states.is_empty()
                    || event
                        .delivery_status
                        .iter()
                        .any(|status| input.delivery_status_states.contains(&status.state))
            })
            .cloned()
            .collect();

        let total_count = matching.len() as u64;
        let items = if input.page.is_unbounded() {
            matching
        } else {
            matching
                .into_iter()
                .skip(input.page.offset() as usize)
                .take(input.page.page_size as usize)
                .collect()
        };

        Ok(PagedResponse {
            items,
            total_count,
            page: input.page,
        })
    }

    async fn update_event_delivery_status(
        &self,
        input: UpdateEventDeliveryStatusInput,
    ) -> Result<DeliveryStatus, RepositoryError> {
        self.updates.lock().await.push(input.clone());

        if self.failing_events.lock().await.contains(&input.event_id) {
            return Err(RepositoryError::Message(format!(
                "update rejected for event {}",
                input.event_id
            )));
        }

        let mut events = self.events.lock().await;
        let status = events
            .iter_mut()
            .flat_map(|event| event.delivery_status.iter_mut())
            .find(|status| status.id == input.id && status.namespace == input.namespace)
            .ok_or_else(|| RepositoryError::DeliveryStatusNotFound {
                namespace: input.namespace.clone(),
                id: input.id,
            })?;

        status.state = input.state;
        status.reason = input.reason;
        status.annotations = input.annotations;
        status.next_attempt = input.next_attempt;
        status.attempts = input.attempts;
        status.updated_at = Utc::now();
        Ok(status.clone())
    }
}

/// Scriptable webhook provider. Sent messages are stored and returned by `get_message`.
pub struct InMemoryWebhookProvider {
    messages: Mutex<HashMap<(String, Uuid), Message>>,
    sent: Mutex<Vec<SendMessageInput>>,
    send_failures: Mutex<VecDeque<ProviderError>>,
    get_failures: Mutex<VecDeque<ProviderError>>,
    route_on_send: Mutex<Option<(DeliveryStatusState, u32)>>,
    get_calls: Mutex<usize>,
}

impl Default for InMemoryWebhookProvider {
    fn default() -> Self {
        Self {
            messages: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            send_failures: Mutex::new(VecDeque::new()),
            get_failures: Mutex::new(VecDeque::new()),
            route_on_send: Mutex::new(Some((DeliveryStatusState::Sending, 1))),
            get_calls: Mutex::new(0),
        }
    }
}

impl InMemoryWebhookProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_message(&self, message: Message) {
        self.messages
            .lock()
            .await
            .insert((message.namespace.clone(), message.event_id), message);
    }

    pub async fn message(&self, namespace: &str, event_id: Uuid) -> Option<Message> {
        self.messages
            .lock()
            .await
            .get(&(namespace.to_string(), event_id))
            .cloned()
    }

    pub async fn sent(&self) -> Vec<SendMessageInput> {
        self.sent.lock().await.clone()
    }

    pub async fn get_calls(&self) -> usize {
        *self.get_calls.lock().await
    }

    pub async fn fail_next_send(&self, error: ProviderError) {
        self.send_failures.lock().await.push_back(error);
    }

    pub async fn fail_next_get(&self, error: ProviderError) {
        self.get_failures.lock().await.push_back(error);
    }

    /// Per-channel state recorded for newly sent messages. `None` sends without routing.
    pub async fn route_sends_as(&self, route: Option<(DeliveryStatusState, u32)>) {
        *self.route_on_send.lock().await = route;
    }
}

#[async_trait]
impl WebhookProvider for InMemoryWebhookProvider {
    async fn get_message(&self, input: GetMessageInput) -> Result<Message, ProviderError> {
        *self.get_calls.lock().await += 1;
        if let Some(error) = self.get_failures.lock().await.pop_front() {
            return Err(error);
        }

        let mut message = self
            .messages
            .lock()
            .await
            .get(&(input.namespace.clone(), input.event_id))
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(input.event_id.to_string()))?;
        if !input.expand_delivery_status {
            message.delivery_status = None;
        }
        Ok(message)
    }

    async fn send_message(&self, input: SendMessageInput) -> Result<Message, ProviderError> {
        self.sent.lock().await.push(input.clone());
        if let Some(error) = self.send_failures.lock().await.pop_front() {
            return Err(error);
        }

        let route = *self.route_on_send.lock().await;
        let message = Message {
            id: input.idempotency_key(),
            namespace: input.namespace.clone(),
            event_id: input.event_id,
            event_type: input.event_type,
            channels: input.channels.clone(),
            annotations: Default::default(),
            delivery_status: route.map(|(state, attempts)| {
                input
                    .channels
                    .iter()
                    .map(|channel_id| ChannelDeliveryStatus {
                        channel_id: *channel_id,
                        state,
                        attempts,
                        next_attempt: None,
                    })
                    .collect()
            }),
        };
        self.insert_message(message.clone()).await;
        Ok(message)
    }
}
